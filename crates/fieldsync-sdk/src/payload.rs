//! 离线变更负载
//!
//! 每种离线操作对应一个枚举变体，以 `type` 字段作为标签序列化。
//! 标签字符串同时写入 outbox 行的 `item_type` 列，便于索引与调试展示。
//! 无法反序列化的存量行按单条错误处理，不影响批次。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
    Document,
}

/// 离线变更负载（带标签联合）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboxPayload {
    /// 创建日志（本地乐观 ID，同步成功后写入 ID 映射）
    #[serde(rename = "daily_log.create")]
    DailyLogCreate {
        local_id: String,
        project_id: String,
        body: Value,
    },

    /// 更新已有日志（服务端 ID 已知）
    #[serde(rename = "daily_log.update")]
    DailyLogUpdate {
        server_id: String,
        project_id: String,
        body: Value,
    },

    /// 附件上传（父日志可能尚未创建）
    #[serde(rename = "daily_log.attachment")]
    AttachmentUpload {
        /// 父日志服务端 ID，创建尚未同步时为空
        #[serde(default)]
        log_id: Option<String>,
        /// 父日志本地 ID，配合 ID 映射解析
        #[serde(default)]
        local_log_id: Option<String>,
        file_path: String,
        file_name: String,
        mime_type: String,
    },

    /// 资产移动
    #[serde(rename = "inventory.move_asset")]
    InventoryMoveAsset {
        location_id: String,
        body: Value,
    },

    /// 范围数量编辑（数量标记 + 可选的百分比修正）
    #[serde(rename = "scope.quantity_edit")]
    ScopeQuantityEdit {
        flags: Value,
        #[serde(default)]
        percent_edit: Option<Value>,
    },

    /// 批量完成度更新
    #[serde(rename = "scope.bulk_percent")]
    BulkPercentUpdate {
        edits: Value,
    },

    /// 上班打卡
    #[serde(rename = "timecard.clock_in")]
    ClockIn {
        body: Value,
    },

    /// 下班打卡
    #[serde(rename = "timecard.clock_out")]
    ClockOut {
        body: Value,
    },

    /// 媒体上传占位（由上传队列处理，同步引擎原样跳过）
    #[serde(rename = "media.upload")]
    MediaUpload {
        media_id: String,
    },
}

impl OutboxPayload {
    /// 标签字符串（与序列化后的 `type` 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            OutboxPayload::DailyLogCreate { .. } => "daily_log.create",
            OutboxPayload::DailyLogUpdate { .. } => "daily_log.update",
            OutboxPayload::AttachmentUpload { .. } => "daily_log.attachment",
            OutboxPayload::InventoryMoveAsset { .. } => "inventory.move_asset",
            OutboxPayload::ScopeQuantityEdit { .. } => "scope.quantity_edit",
            OutboxPayload::BulkPercentUpdate { .. } => "scope.bulk_percent",
            OutboxPayload::ClockIn { .. } => "timecard.clock_in",
            OutboxPayload::ClockOut { .. } => "timecard.clock_out",
            OutboxPayload::MediaUpload { .. } => "media.upload",
        }
    }

    /// 是否由媒体上传队列负责处理
    pub fn is_media_upload(&self) -> bool {
        matches!(self, OutboxPayload::MediaUpload { .. })
    }
}
