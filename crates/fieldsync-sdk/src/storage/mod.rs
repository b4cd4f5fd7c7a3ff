//! 本地持久化模块
//!
//! 所有离线数据落在同一个 SQLite 文件里：
//! - cache：读缓存（JSON 块，cache-aside）
//! - kv：键值对（ID 映射、同步偏好）
//! - outbox：离线变更队列
//! - media_uploads：媒体上传跟踪行
//! - usage_events：使用记录（项目排序）
//!
//! 单连接 + WAL，连接由各子存储共享。

pub mod cache;
pub mod kv;
pub mod media;
pub mod outbox;
pub mod usage;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{FieldSyncError, Result};

pub use cache::CacheStore;
pub use kv::KvStore;
pub use media::{MediaQueueStatus, MediaStore, MediaUploadItem, MediaUploadStatus};
pub use outbox::{OutboxItem, OutboxStatus, OutboxStore};
pub use usage::{ProjectScore, UsageAction, UsageTracker};

/// 离线存储
///
/// 打开时幂等建表，并恢复上次崩溃遗留的 `PROCESSING` 行。
#[derive(Debug, Clone)]
pub struct OfflineStore {
    conn: Arc<Mutex<Connection>>,
}

impl OfflineStore {
    /// 打开（或创建）离线数据库
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FieldSyncError::IO(format!("创建数据库目录失败: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| FieldSyncError::Database(format!("打开数据库失败: {}", e)))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| FieldSyncError::Database(format!("设置 WAL 模式失败: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| FieldSyncError::Database(format!("设置同步模式失败: {}", e)))?;

        Self::create_tables(&conn)?;

        let store = Self { conn: Arc::new(Mutex::new(conn)) };

        // 崩溃恢复：上次中断的行重新回到待处理
        let recovered = store.outbox().recover_stuck().await?;
        if recovered > 0 {
            info!("恢复了 {} 条中断的变更", recovered);
        }

        info!("✅ 离线数据库已打开: {}", db_path.display());
        Ok(store)
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key        TEXT PRIMARY KEY,
                json       TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT
            );

            CREATE TABLE IF NOT EXISTS outbox (
                id         TEXT PRIMARY KEY,
                item_type  TEXT NOT NULL,
                payload    TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                status     TEXT NOT NULL,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status);
            CREATE INDEX IF NOT EXISTS idx_outbox_created_at ON outbox(created_at);

            CREATE TABLE IF NOT EXISTS media_uploads (
                id             TEXT PRIMARY KEY,
                outbox_id      TEXT NOT NULL,
                log_id         TEXT,
                local_log_id   TEXT,
                file_path      TEXT NOT NULL,
                file_name      TEXT NOT NULL,
                mime_type      TEXT NOT NULL,
                media_type     TEXT NOT NULL,
                bytes_total    INTEGER NOT NULL,
                bytes_uploaded INTEGER NOT NULL,
                status         TEXT NOT NULL,
                network_tier   TEXT NOT NULL,
                wifi_only      INTEGER NOT NULL,
                created_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_media_uploads_status ON media_uploads(status);
            CREATE INDEX IF NOT EXISTS idx_media_uploads_created_at ON media_uploads(created_at);

            CREATE TABLE IF NOT EXISTS usage_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                action     TEXT NOT NULL,
                ts         INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_events_project ON usage_events(project_id);
            CREATE INDEX IF NOT EXISTS idx_usage_events_ts ON usage_events(ts);
            "#,
        )
        .map_err(|e| FieldSyncError::Database(format!("创建数据库表失败: {}", e)))?;

        Ok(())
    }

    /// 底层连接（子存储共享）
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    pub fn outbox(&self) -> OutboxStore {
        OutboxStore::new(self.connection())
    }

    pub fn media(&self) -> MediaStore {
        MediaStore::new(self.connection())
    }

    pub fn cache(&self) -> CacheStore {
        CacheStore::new(self.connection())
    }

    pub fn kv(&self) -> KvStore {
        KvStore::new(self.connection())
    }

    pub fn usage(&self) -> UsageTracker {
        UsageTracker::new(self.connection())
    }
}

/// 当前毫秒时间戳
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline.db");

        let store = OfflineStore::open(&path).await.unwrap();
        store.kv().set("a", "1").await.unwrap();
        drop(store);

        // 再次打开不破坏既有数据
        let store = OfflineStore::open(&path).await.unwrap();
        assert_eq!(store.kv().get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deep").join("offline.db");

        OfflineStore::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
