//! 读缓存存储
//!
//! cache-aside 模式：UI 先读缓存，同步成功后由引擎刷新。
//! 值为 JSON 文本，写入覆盖（last-writer-wins），附带更新时间戳。

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{FieldSyncError, Result};
use crate::storage::now_millis;

/// 日志列表缓存键
pub fn daily_logs_cache_key(project_id: &str) -> String {
    format!("daily_logs:{}", project_id)
}

/// 某位置库存持有缓存键
pub fn location_holdings_cache_key(location_id: &str) -> String {
    format!("inventory.holdings.location:{}", location_id)
}

/// 打卡状态缓存键
pub const TIMECARD_STATUS_CACHE_KEY: &str = "timecard.status";

/// 近期工时缓存键
pub const TIMECARD_RECENT_CACHE_KEY: &str = "timecard.recent";

#[derive(Debug, Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl CacheStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| FieldSyncError::Serialization(format!("序列化缓存值失败: {}", e)))?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cache (key, json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            params![key, json, now_millis()],
        )
        .map_err(|e| FieldSyncError::Database(format!("写入缓存失败: {}", e)))?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row("SELECT json FROM cache WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(|e| FieldSyncError::Database(format!("读取缓存失败: {}", e)))?;

        match json {
            Some(text) => {
                let value = serde_json::from_str(&text)
                    .map_err(|e| FieldSyncError::Serialization(format!("反序列化缓存值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM cache WHERE key = ?1", params![key])
            .map_err(|e| FieldSyncError::Database(format!("删除缓存失败: {}", e)))?;
        Ok(())
    }

    /// 缓存项的最后更新时间（毫秒），不存在时为 None
    pub async fn updated_at(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT updated_at FROM cache WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| FieldSyncError::Database(format!("读取缓存时间戳失败: {}", e)))
    }

    /// 把本地乐观草稿插入缓存的日志列表头部
    ///
    /// 列表缓存不存在时创建单元素列表。
    pub async fn push_local_daily_log(&self, project_id: &str, draft: Value) -> Result<()> {
        let key = daily_logs_cache_key(project_id);
        let mut list: Vec<Value> = self.get(&key).await?.unwrap_or_default();
        list.insert(0, draft);
        self.set(&key, &list).await
    }

    /// 用服务端对象替换缓存列表中 id 匹配的本地草稿
    pub async fn replace_daily_log(
        &self,
        project_id: &str,
        local_id: &str,
        server_object: &Value,
    ) -> Result<()> {
        let key = daily_logs_cache_key(project_id);
        let Some(mut list) = self.get::<Vec<Value>>(&key).await? else {
            return Ok(());
        };

        for entry in list.iter_mut() {
            if entry["id"].as_str() == Some(local_id) {
                *entry = server_object.clone();
            }
        }
        self.set(&key, &list).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OfflineStore;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_cache() -> (TempDir, CacheStore) {
        let dir = TempDir::new().unwrap();
        let store = OfflineStore::open(&dir.path().join("offline.db")).await.unwrap();
        let cache = store.cache();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_set_get_typed() {
        let (_dir, cache) = open_cache().await;

        cache.set("nums", &vec![1, 2, 3]).await.unwrap();
        let nums: Option<Vec<i32>> = cache.get("nums").await.unwrap();
        assert_eq!(nums, Some(vec![1, 2, 3]));

        assert!(cache.updated_at("nums").await.unwrap().is_some());
        assert_eq!(cache.updated_at("missing").await.unwrap(), None);

        cache.delete("nums").await.unwrap();
        let nums: Option<Vec<i32>> = cache.get("nums").await.unwrap();
        assert_eq!(nums, None);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let (_dir, cache) = open_cache().await;

        cache.set("k", &json!({"v": 1})).await.unwrap();
        cache.set("k", &json!({"v": 2})).await.unwrap();

        let value: Value = cache.get("k").await.unwrap().unwrap();
        assert_eq!(value["v"], 2);
    }

    #[tokio::test]
    async fn test_push_and_replace_local_daily_log() {
        let (_dir, cache) = open_cache().await;

        cache
            .push_local_daily_log("p1", json!({"id": "local_1", "notes": "draft"}))
            .await
            .unwrap();
        cache
            .push_local_daily_log("p1", json!({"id": "local_2", "notes": "newer"}))
            .await
            .unwrap();

        let list: Vec<Value> = cache.get(&daily_logs_cache_key("p1")).await.unwrap().unwrap();
        assert_eq!(list.len(), 2);
        // 新草稿在列表头部
        assert_eq!(list[0]["id"], "local_2");

        cache
            .replace_daily_log("p1", "local_1", &json!({"id": "srv_9", "notes": "synced"}))
            .await
            .unwrap();

        let list: Vec<Value> = cache.get(&daily_logs_cache_key("p1")).await.unwrap().unwrap();
        assert_eq!(list[1]["id"], "srv_9");
        assert_eq!(list[0]["id"], "local_2");
    }

    #[tokio::test]
    async fn test_replace_without_cached_list_is_noop() {
        let (_dir, cache) = open_cache().await;

        cache
            .replace_daily_log("p1", "local_1", &json!({"id": "srv_1"}))
            .await
            .unwrap();
        let list: Option<Vec<Value>> = cache.get(&daily_logs_cache_key("p1")).await.unwrap();
        assert!(list.is_none());
    }
}
