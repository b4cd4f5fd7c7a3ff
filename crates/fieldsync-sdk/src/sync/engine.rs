//! 同步引擎
//!
//! 把变更队列里的行逐条派发到远端：
//! - 严格按入队顺序、一次一条（保证同实体操作的先后关系）
//! - 单条失败只标记该行，批次继续；认证失败提前终止批次
//! - 创建类操作成功后写入本地 ID → 服务端 ID 映射，供后续依赖行解析
//! - 媒体占位行原样跳过，由上传队列推进

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::error::{FieldSyncError, Result};
use crate::network::{NetworkMonitor, NetworkTier};
use crate::payload::OutboxPayload;
use crate::session::SessionProvider;
use crate::storage::cache::{
    daily_logs_cache_key, location_holdings_cache_key, TIMECARD_RECENT_CACHE_KEY,
    TIMECARD_STATUS_CACHE_KEY,
};
use crate::storage::outbox::OUTBOX_BATCH_LIMIT;
use crate::storage::OfflineStore;
use crate::sync::media_queue::MediaUploadQueue;

/// 认证失败的批次终止原因
pub const AUTH_FAILED_REASON: &str = "Authentication failed - please log in again";

/// 附件等待父日志创建的错误信息
pub const ATTACHMENT_WAITING_REASON: &str = "Attachment waiting for daily log creation";

/// 一次同步的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// 成功完成的条数（含媒体上传）
    pub processed: usize,
    /// 标记为错误的条数（含媒体上传）
    pub failed: usize,
    /// 批次被跳过或提前终止的原因
    pub skipped_reason: Option<String>,
}

impl SyncOutcome {
    fn skipped(reason: &str) -> Self {
        Self { skipped_reason: Some(reason.to_string()), ..Default::default() }
    }
}

/// 同步引擎
#[derive(Debug)]
pub struct SyncEngine {
    store: OfflineStore,
    api: Arc<dyn RemoteApi>,
    session: Arc<dyn SessionProvider>,
    network: Arc<NetworkMonitor>,
    media_queue: Arc<MediaUploadQueue>,
}

impl SyncEngine {
    pub fn new(
        store: OfflineStore,
        api: Arc<dyn RemoteApi>,
        session: Arc<dyn SessionProvider>,
        network: Arc<NetworkMonitor>,
        media_queue: Arc<MediaUploadQueue>,
    ) -> Self {
        Self { store, api, session, network, media_queue }
    }

    /// 同步策略检查，返回不可同步的原因（可同步时为 None）
    pub async fn policy_block_reason(&self) -> Result<Option<String>> {
        let state = self.network.state().await;
        if !state.connected {
            return Ok(Some("offline".to_string()));
        }
        if self.store.kv().wifi_only_sync().await? && state.tier != NetworkTier::Wifi {
            return Ok(Some("wifi-only sync enabled and not on wifi".to_string()));
        }
        if !self.session.has_valid_session().await {
            return Ok(Some("no valid session".to_string()));
        }
        Ok(None)
    }

    /// 执行一轮同步
    ///
    /// 批次层面总是返回 Ok，单条失败体现在 `failed` 计数里。
    pub async fn sync_once(&self) -> Result<SyncOutcome> {
        if let Some(reason) = self.policy_block_reason().await? {
            debug!("跳过同步: {}", reason);
            return Ok(SyncOutcome::skipped(&reason));
        }

        let outbox = self.store.outbox();
        let items = outbox.list_eligible(OUTBOX_BATCH_LIMIT).await?;

        let mut outcome = SyncOutcome::default();
        if !items.is_empty() {
            info!("开始同步 {} 条变更", items.len());
        }

        for item in items {
            // 先反序列化再占行，坏行不进入 PROCESSING
            let payload: OutboxPayload = match serde_json::from_str(&item.payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!("变更负载无法解析: id={}, {}", item.id, e);
                    outbox.mark_error(&item.id, &format!("undecodable payload: {}", e)).await?;
                    outcome.failed += 1;
                    continue;
                }
            };

            // 媒体占位行由上传队列推进，状态保持不动
            if payload.is_media_upload() {
                continue;
            }

            outbox.mark_processing(&item.id).await?;

            match self.dispatch(&payload).await {
                Ok(()) => {
                    outbox.mark_done(&item.id).await?;
                    outcome.processed += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    outbox.mark_error(&item.id, &message).await?;
                    outcome.failed += 1;

                    // 认证失效时后续行必然同样失败，终止本批次
                    if e.is_auth_failure() {
                        warn!("认证失败，终止本轮同步");
                        outcome.skipped_reason = Some(AUTH_FAILED_REASON.to_string());
                        break;
                    }
                    warn!("变更同步失败: id={}, {}", item.id, message);
                }
            }
        }

        // 变更走完后顺带推进媒体上传
        if outcome.skipped_reason.is_none() {
            let media = self.media_queue.process().await?;
            outcome.processed += media.uploaded;
            outcome.failed += media.failed;
        }

        if outcome.processed > 0 || outcome.failed > 0 {
            info!("✅ 同步完成: 成功 {} 条, 失败 {} 条", outcome.processed, outcome.failed);
        }
        Ok(outcome)
    }

    async fn dispatch(&self, payload: &OutboxPayload) -> Result<()> {
        match payload {
            OutboxPayload::DailyLogCreate { local_id, project_id, body } => {
                self.handle_daily_log_create(local_id, project_id, body).await
            }
            OutboxPayload::DailyLogUpdate { server_id, project_id, body } => {
                self.handle_daily_log_update(server_id, project_id, body).await
            }
            OutboxPayload::AttachmentUpload { log_id, local_log_id, file_path, file_name, mime_type } => {
                self.handle_attachment_upload(
                    log_id.as_deref(),
                    local_log_id.as_deref(),
                    file_path,
                    file_name,
                    mime_type,
                )
                .await
            }
            OutboxPayload::InventoryMoveAsset { location_id, body } => {
                self.handle_move_asset(location_id, body).await
            }
            OutboxPayload::ScopeQuantityEdit { flags, percent_edit } => {
                self.handle_scope_quantity_edit(flags, percent_edit.as_ref()).await
            }
            OutboxPayload::BulkPercentUpdate { edits } => {
                self.api.submit_percent_edits(edits).await.map(|_| ())
            }
            OutboxPayload::ClockIn { body } => self.handle_clock_in(body).await,
            OutboxPayload::ClockOut { body } => self.handle_clock_out(body).await,
            OutboxPayload::MediaUpload { .. } => Ok(()),
        }
    }

    async fn handle_daily_log_create(
        &self,
        local_id: &str,
        project_id: &str,
        body: &Value,
    ) -> Result<()> {
        let server_object = self.api.create_daily_log(body).await?;
        let server_id = server_object["id"]
            .as_str()
            .ok_or_else(|| FieldSyncError::Serialization("创建响应缺少 id 字段".to_string()))?
            .to_string();

        // 先落映射，后续依赖行（附件/更新）靠它解析父 ID
        self.store.kv().set_id_mapping("daily_log", local_id, &server_id).await?;
        self.store.cache().replace_daily_log(project_id, local_id, &server_object).await?;

        self.refresh_daily_logs(project_id).await;
        Ok(())
    }

    async fn handle_daily_log_update(
        &self,
        server_id: &str,
        project_id: &str,
        body: &Value,
    ) -> Result<()> {
        self.api.update_daily_log(server_id, body).await?;
        self.refresh_daily_logs(project_id).await;
        Ok(())
    }

    /// 解析附件的父日志服务端 ID
    ///
    /// 负载里直接带 `log_id` 的优先；否则查本地 ID 映射，
    /// 映射缺失说明创建行尚未同步，返回可重试的依赖错误。
    pub(crate) async fn resolve_parent_log_id(
        store: &OfflineStore,
        log_id: Option<&str>,
        local_log_id: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = log_id {
            return Ok(id.to_string());
        }
        if let Some(local) = local_log_id {
            if let Some(server_id) = store.kv().get_id_mapping("daily_log", local).await? {
                return Ok(server_id);
            }
        }
        Err(FieldSyncError::DependencyPending(ATTACHMENT_WAITING_REASON.to_string()))
    }

    async fn handle_attachment_upload(
        &self,
        log_id: Option<&str>,
        local_log_id: Option<&str>,
        file_path: &str,
        file_name: &str,
        mime_type: &str,
    ) -> Result<()> {
        let parent = Self::resolve_parent_log_id(&self.store, log_id, local_log_id).await?;
        self.api
            .upload_attachment(&parent, Path::new(file_path), file_name, mime_type)
            .await?;
        Ok(())
    }

    async fn handle_move_asset(&self, location_id: &str, body: &Value) -> Result<()> {
        self.api.move_asset(body).await?;

        // 尽力而为的缓存刷新，失败不影响变更结果
        match self.api.location_holdings(location_id).await {
            Ok(holdings) => {
                let key = location_holdings_cache_key(location_id);
                if let Err(e) = self.store.cache().set(&key, &holdings).await {
                    debug!("刷新库存缓存失败（已忽略）: {}", e);
                }
            }
            Err(e) => debug!("拉取库存持有失败（已忽略）: {}", e),
        }
        Ok(())
    }

    /// 数量标记 + 可选的百分比修正，两步都成功才算完成
    ///
    /// 第一步成功、第二步失败时整条标记错误，重试会重放两步，
    /// 远端两个接口都按幂等语义设计。
    async fn handle_scope_quantity_edit(
        &self,
        flags: &Value,
        percent_edit: Option<&Value>,
    ) -> Result<()> {
        self.api.submit_quantity_flags(flags).await?;
        if let Some(percent) = percent_edit {
            self.api.submit_percent_edits(percent).await?;
        }
        Ok(())
    }

    async fn handle_clock_in(&self, body: &Value) -> Result<()> {
        self.api.clock_in(body).await?;
        self.refresh_timecard_status().await;
        Ok(())
    }

    async fn handle_clock_out(&self, body: &Value) -> Result<()> {
        self.api.clock_out(body).await?;
        self.refresh_timecard_status().await;

        match self.api.timecard_recent().await {
            Ok(recent) => {
                if let Err(e) = self.store.cache().set(TIMECARD_RECENT_CACHE_KEY, &recent).await {
                    debug!("刷新近期工时缓存失败（已忽略）: {}", e);
                }
            }
            Err(e) => debug!("拉取近期工时失败（已忽略）: {}", e),
        }
        Ok(())
    }

    async fn refresh_daily_logs(&self, project_id: &str) {
        match self.api.list_daily_logs(project_id).await {
            Ok(list) => {
                let key = daily_logs_cache_key(project_id);
                if let Err(e) = self.store.cache().set(&key, &list).await {
                    debug!("刷新日志列表缓存失败（已忽略）: {}", e);
                }
            }
            Err(e) => debug!("拉取日志列表失败（已忽略）: {}", e),
        }
    }

    async fn refresh_timecard_status(&self) {
        match self.api.timecard_status().await {
            Ok(status) => {
                if let Err(e) = self.store.cache().set(TIMECARD_STATUS_CACHE_KEY, &status).await {
                    debug!("刷新打卡状态缓存失败（已忽略）: {}", e);
                }
            }
            Err(e) => debug!("拉取打卡状态失败（已忽略）: {}", e),
        }
    }
}
