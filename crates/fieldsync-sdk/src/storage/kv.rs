//! 键值存储
//!
//! 字符串到字符串的小量配置与映射：
//! - 本地 ID → 服务端 ID 映射（`<kind>.map:<local_id>`）
//! - 同步偏好（仅 Wi-Fi 同步开关）

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{FieldSyncError, Result};

/// 仅 Wi-Fi 同步开关的存储键
pub const WIFI_ONLY_SYNC_KEY: &str = "settings.wifi_only_sync";

#[derive(Debug, Clone)]
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
}

impl KvStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| FieldSyncError::KvStore(format!("写入键值失败: {}", e)))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| FieldSyncError::KvStore(format!("读取键值失败: {}", e)))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| FieldSyncError::KvStore(format!("删除键值失败: {}", e)))?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// 写入本地 ID → 服务端 ID 映射
    pub async fn set_id_mapping(&self, kind: &str, local_id: &str, server_id: &str) -> Result<()> {
        self.set(&Self::mapping_key(kind, local_id), server_id).await
    }

    /// 查询本地 ID 对应的服务端 ID
    pub async fn get_id_mapping(&self, kind: &str, local_id: &str) -> Result<Option<String>> {
        self.get(&Self::mapping_key(kind, local_id)).await
    }

    fn mapping_key(kind: &str, local_id: &str) -> String {
        format!("{}.map:{}", kind, local_id)
    }

    /// 仅 Wi-Fi 同步偏好（默认关闭）
    pub async fn wifi_only_sync(&self) -> Result<bool> {
        Ok(self.get(WIFI_ONLY_SYNC_KEY).await?.as_deref() == Some("true"))
    }

    pub async fn set_wifi_only_sync(&self, enabled: bool) -> Result<()> {
        self.set(WIFI_ONLY_SYNC_KEY, if enabled { "true" } else { "false" }).await
    }
}
