//! 变更队列存储
//!
//! 离线变更先落盘再同步。状态机：
//! PENDING → PROCESSING → DONE / ERROR，ERROR 行保持可重试。
//! 启动时把遗留的 PROCESSING 行恢复为 PENDING。

use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{FieldSyncError, Result};
use crate::payload::OutboxPayload;
use crate::storage::now_millis;

/// 单次同步批次的行数上限
pub const OUTBOX_BATCH_LIMIT: usize = 50;

/// 变更行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Done => "DONE",
            OutboxStatus::Error => "ERROR",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "DONE" => Ok(OutboxStatus::Done),
            "ERROR" => Ok(OutboxStatus::Error),
            other => Err(FieldSyncError::Database(format!("未知的变更状态: {}", other))),
        }
    }
}

/// 变更队列行
#[derive(Debug, Clone)]
pub struct OutboxItem {
    pub id: String,
    pub item_type: String,
    /// 负载 JSON 原文，反序列化推迟到派发时
    pub payload: String,
    pub created_at: i64,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
}

impl OutboxItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_text: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            item_type: row.get(1)?,
            payload: row.get(2)?,
            created_at: row.get(3)?,
            status: OutboxStatus::parse(&status_text).unwrap_or(OutboxStatus::Error),
            last_error: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OutboxStore {
    conn: Arc<Mutex<Connection>>,
}

impl OutboxStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 入队一条变更（纯本地写，不触网）
    pub async fn enqueue(&self, payload: &OutboxPayload) -> Result<String> {
        let id = format!("ob_{}", Uuid::new_v4().simple());
        let json = serde_json::to_string(payload)
            .map_err(|e| FieldSyncError::Serialization(format!("序列化变更负载失败: {}", e)))?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO outbox (id, item_type, payload, created_at, status, last_error)
             VALUES (?1, ?2, ?3, ?4, 'PENDING', NULL)",
            params![id, payload.kind(), json, now_millis()],
        )
        .map_err(|e| FieldSyncError::Database(format!("写入变更队列失败: {}", e)))?;

        Ok(id)
    }

    /// 取可派发的行（PENDING/ERROR），按入队时间升序
    pub async fn list_eligible(&self, limit: usize) -> Result<Vec<OutboxItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, item_type, payload, created_at, status, last_error
                 FROM outbox WHERE status IN ('PENDING', 'ERROR')
                 ORDER BY created_at ASC LIMIT ?1",
            )
            .map_err(|e| FieldSyncError::Database(format!("查询变更队列失败: {}", e)))?;

        let items = stmt
            .query_map(params![limit as i64], OutboxItem::from_row)
            .map_err(|e| FieldSyncError::Database(format!("查询变更队列失败: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| FieldSyncError::Database(format!("读取变更行失败: {}", e)))?;

        Ok(items)
    }

    /// 可派发行数
    pub async fn count_eligible(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status IN ('PENDING', 'ERROR')",
            [],
            |row| row.get(0),
        )
        .map_err(|e| FieldSyncError::Database(format!("统计变更队列失败: {}", e)))
    }

    /// 最近入队的行（调试视图，新的在前）
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<OutboxItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, item_type, payload, created_at, status, last_error
                 FROM outbox ORDER BY created_at DESC LIMIT ?1",
            )
            .map_err(|e| FieldSyncError::Database(format!("查询变更队列失败: {}", e)))?;

        let items = stmt
            .query_map(params![limit as i64], OutboxItem::from_row)
            .map_err(|e| FieldSyncError::Database(format!("查询变更队列失败: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| FieldSyncError::Database(format!("读取变更行失败: {}", e)))?;

        Ok(items)
    }

    pub async fn get(&self, id: &str) -> Result<Option<OutboxItem>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, item_type, payload, created_at, status, last_error
             FROM outbox WHERE id = ?1",
            params![id],
            OutboxItem::from_row,
        )
        .optional()
        .map_err(|e| FieldSyncError::Database(format!("读取变更行失败: {}", e)))
    }

    /// 标记为处理中（清除上次错误）
    pub async fn mark_processing(&self, id: &str) -> Result<()> {
        self.update_status(id, OutboxStatus::Processing, None).await
    }

    pub async fn mark_done(&self, id: &str) -> Result<()> {
        self.update_status(id, OutboxStatus::Done, None).await
    }

    pub async fn mark_error(&self, id: &str, reason: &str) -> Result<()> {
        self.update_status(id, OutboxStatus::Error, Some(reason)).await
    }

    async fn update_status(&self, id: &str, status: OutboxStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE outbox SET status = ?1, last_error = ?2 WHERE id = ?3",
                params![status.as_str(), error, id],
            )
            .map_err(|e| FieldSyncError::Database(format!("更新变更状态失败: {}", e)))?;

        if changed == 0 {
            return Err(FieldSyncError::NotFound(format!("变更行不存在: {}", id)));
        }
        Ok(())
    }

    /// 恢复上次中断的 PROCESSING 行，返回恢复条数
    pub async fn recover_stuck(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE outbox SET status = 'PENDING',
                 last_error = 'Recovered from stuck PROCESSING state'
                 WHERE status = 'PROCESSING'",
                [],
            )
            .map_err(|e| FieldSyncError::Database(format!("恢复中断变更失败: {}", e)))?;
        Ok(changed)
    }

    /// 把所有 ERROR 行重置为 PENDING（用户手动"全部重试"）
    pub async fn reset_errors(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE outbox SET status = 'PENDING', last_error = NULL WHERE status = 'ERROR'",
                [],
            )
            .map_err(|e| FieldSyncError::Database(format!("重置错误变更失败: {}", e)))?;
        Ok(changed)
    }

    /// 丢弃所有未完成的变更（用户手动"清空队列"）
    pub async fn clear_pending_and_errors(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute("DELETE FROM outbox WHERE status IN ('PENDING', 'ERROR')", [])
            .map_err(|e| FieldSyncError::Database(format!("清空变更队列失败: {}", e)))?;
        Ok(changed)
    }
}
