//! 媒体上传跟踪存储
//!
//! 每条媒体上传对应一条跟踪行，和占位的 outbox 行一一对应，
//! 状态由上传队列保持同步推进：QUEUED → UPLOADING → DONE / ERROR。

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{FieldSyncError, Result};
use crate::network::NetworkTier;
use crate::payload::MediaType;
use crate::storage::now_millis;

/// 单次上传批次的行数上限
pub const MEDIA_BATCH_LIMIT: usize = 20;

/// 媒体上传行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaUploadStatus {
    Queued,
    Uploading,
    Done,
    Error,
}

impl MediaUploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaUploadStatus::Queued => "QUEUED",
            MediaUploadStatus::Uploading => "UPLOADING",
            MediaUploadStatus::Done => "DONE",
            MediaUploadStatus::Error => "ERROR",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "QUEUED" => Ok(MediaUploadStatus::Queued),
            "UPLOADING" => Ok(MediaUploadStatus::Uploading),
            "DONE" => Ok(MediaUploadStatus::Done),
            "ERROR" => Ok(MediaUploadStatus::Error),
            other => Err(FieldSyncError::Database(format!("未知的上传状态: {}", other))),
        }
    }
}

fn media_type_str(media_type: MediaType) -> &'static str {
    match media_type {
        MediaType::Photo => "photo",
        MediaType::Video => "video",
        MediaType::Document => "document",
    }
}

fn parse_media_type(text: &str) -> MediaType {
    match text {
        "video" => MediaType::Video,
        "document" => MediaType::Document,
        _ => MediaType::Photo,
    }
}

fn tier_str(tier: NetworkTier) -> &'static str {
    match tier {
        NetworkTier::Wifi => "wifi",
        NetworkTier::Cellular => "cellular",
    }
}

/// 媒体上传行
#[derive(Debug, Clone)]
pub struct MediaUploadItem {
    pub id: String,
    /// 对应的占位 outbox 行
    pub outbox_id: String,
    /// 父日志服务端 ID（创建已同步时）
    pub log_id: Option<String>,
    /// 父日志本地 ID（配合 ID 映射解析）
    pub local_log_id: Option<String>,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub media_type: MediaType,
    pub bytes_total: i64,
    pub bytes_uploaded: i64,
    pub status: MediaUploadStatus,
    /// 入队时观察到的网络档位（诊断用）
    pub network_tier: String,
    pub wifi_only: bool,
    pub created_at: i64,
}

impl MediaUploadItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_text: String = row.get(10)?;
        let media_type_text: String = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            outbox_id: row.get(1)?,
            log_id: row.get(2)?,
            local_log_id: row.get(3)?,
            file_path: row.get(4)?,
            file_name: row.get(5)?,
            mime_type: row.get(6)?,
            media_type: parse_media_type(&media_type_text),
            bytes_total: row.get(8)?,
            bytes_uploaded: row.get(9)?,
            status: MediaUploadStatus::parse(&status_text).unwrap_or(MediaUploadStatus::Error),
            network_tier: row.get(11)?,
            wifi_only: row.get::<_, i64>(12)? != 0,
            created_at: row.get(13)?,
        })
    }
}

const MEDIA_COLUMNS: &str = "id, outbox_id, log_id, local_log_id, file_path, file_name, mime_type,
    media_type, bytes_total, bytes_uploaded, status, network_tier, wifi_only, created_at";

/// 队列状态汇总
///
/// 只统计在途行（QUEUED/UPLOADING），历史行不计入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaQueueStatus {
    pub queued: i64,
    pub uploading: i64,
    /// queued + uploading
    pub total: i64,
    /// 标记了仅 Wi-Fi 且在排队中的行数
    pub wifi_waiting: i64,
}

/// 新建媒体上传行的参数
#[derive(Debug, Clone)]
pub struct NewMediaUpload {
    /// 行 ID 由调用方生成，先写入占位 outbox 负载再落本行
    pub id: String,
    pub outbox_id: String,
    pub log_id: Option<String>,
    pub local_log_id: Option<String>,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub media_type: MediaType,
    pub bytes_total: i64,
    pub wifi_only: bool,
    pub observed_tier: NetworkTier,
}

/// 生成媒体上传行 ID
pub fn new_media_id() -> String {
    format!("mu_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    conn: Arc<Mutex<Connection>>,
}

impl MediaStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn insert(&self, upload: &NewMediaUpload) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO media_uploads (id, outbox_id, log_id, local_log_id, file_path, file_name,
                mime_type, media_type, bytes_total, bytes_uploaded, status, network_tier,
                wifi_only, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 'QUEUED', ?10, ?11, ?12)",
            params![
                upload.id,
                upload.outbox_id,
                upload.log_id,
                upload.local_log_id,
                upload.file_path,
                upload.file_name,
                upload.mime_type,
                media_type_str(upload.media_type),
                upload.bytes_total,
                tier_str(upload.observed_tier),
                upload.wifi_only as i64,
                now_millis(),
            ],
        )
        .map_err(|e| FieldSyncError::Database(format!("写入媒体上传行失败: {}", e)))?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<MediaUploadItem>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM media_uploads WHERE id = ?1", MEDIA_COLUMNS),
            params![id],
            MediaUploadItem::from_row,
        )
        .optional()
        .map_err(|e| FieldSyncError::Database(format!("读取媒体上传行失败: {}", e)))
    }

    /// 待上传行（QUEUED/ERROR），按入队时间升序
    pub async fn list_eligible(&self, limit: usize) -> Result<Vec<MediaUploadItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM media_uploads WHERE status IN ('QUEUED', 'ERROR')
                 ORDER BY created_at ASC LIMIT ?1",
                MEDIA_COLUMNS
            ))
            .map_err(|e| FieldSyncError::Database(format!("查询媒体上传行失败: {}", e)))?;

        let items = stmt
            .query_map(params![limit as i64], MediaUploadItem::from_row)
            .map_err(|e| FieldSyncError::Database(format!("查询媒体上传行失败: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| FieldSyncError::Database(format!("读取媒体上传行失败: {}", e)))?;

        Ok(items)
    }

    /// 上传历史（新的在前）
    pub async fn history(&self, limit: usize) -> Result<Vec<MediaUploadItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM media_uploads ORDER BY created_at DESC LIMIT ?1",
                MEDIA_COLUMNS
            ))
            .map_err(|e| FieldSyncError::Database(format!("查询媒体上传行失败: {}", e)))?;

        let items = stmt
            .query_map(params![limit as i64], MediaUploadItem::from_row)
            .map_err(|e| FieldSyncError::Database(format!("查询媒体上传行失败: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| FieldSyncError::Database(format!("读取媒体上传行失败: {}", e)))?;

        Ok(items)
    }

    pub async fn mark_uploading(&self, id: &str) -> Result<()> {
        self.update_status(id, MediaUploadStatus::Uploading, None).await
    }

    /// 标记完成并记满已上传字节
    pub async fn mark_done(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE media_uploads SET status = 'DONE', bytes_uploaded = bytes_total
                 WHERE id = ?1",
                params![id],
            )
            .map_err(|e| FieldSyncError::Database(format!("更新上传状态失败: {}", e)))?;
        if changed == 0 {
            return Err(FieldSyncError::NotFound(format!("媒体上传行不存在: {}", id)));
        }
        Ok(())
    }

    pub async fn mark_error(&self, id: &str) -> Result<()> {
        self.update_status(id, MediaUploadStatus::Error, None).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: MediaUploadStatus,
        bytes_uploaded: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE media_uploads SET status = ?1,
                 bytes_uploaded = COALESCE(?2, bytes_uploaded) WHERE id = ?3",
                params![status.as_str(), bytes_uploaded, id],
            )
            .map_err(|e| FieldSyncError::Database(format!("更新上传状态失败: {}", e)))?;
        if changed == 0 {
            return Err(FieldSyncError::NotFound(format!("媒体上传行不存在: {}", id)));
        }
        Ok(())
    }

    /// 可重试行数（QUEUED/ERROR，调度前置检查用）
    pub async fn count_eligible(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM media_uploads WHERE status IN ('QUEUED', 'ERROR')",
            [],
            |row| row.get(0),
        )
        .map_err(|e| FieldSyncError::Database(format!("统计媒体队列失败: {}", e)))
    }

    /// 队列状态汇总（纯读，不触网）
    pub async fn queue_status(&self) -> Result<MediaQueueStatus> {
        let conn = self.conn.lock().await;
        let (queued, uploading, wifi_waiting) = conn
            .query_row(
                "SELECT
                    COUNT(CASE WHEN status = 'QUEUED' THEN 1 END),
                    COUNT(CASE WHEN status = 'UPLOADING' THEN 1 END),
                    COUNT(CASE WHEN wifi_only = 1 AND status = 'QUEUED' THEN 1 END)
                 FROM media_uploads",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .map_err(|e| FieldSyncError::Database(format!("统计媒体队列失败: {}", e)))?;

        Ok(MediaQueueStatus { queued, uploading, total: queued + uploading, wifi_waiting })
    }
}
