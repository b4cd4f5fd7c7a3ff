//! 媒体上传队列
//!
//! 照片/视频/文档的上传走独立队列，按网络档位控制并发：
//! Wi-Fi 下最多 3 个并发，蜂窝网络串行且批内每次派发间隔 500ms。
//! 每条媒体行和它的占位 outbox 行状态同步推进，单机串行（进程内
//! 重入保护），上传有超时上限，失败行保持可重试。

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::error::{FieldSyncError, Result};
use crate::network::{NetworkMonitor, NetworkTier};
use crate::payload::{MediaType, OutboxPayload};
use crate::storage::media::{new_media_id, MediaQueueStatus, MediaUploadItem, NewMediaUpload, MEDIA_BATCH_LIMIT};
use crate::storage::OfflineStore;
use crate::sync::engine::SyncEngine;

/// Wi-Fi 下的上传并发上限
const WIFI_CONCURRENCY: usize = 3;
/// 蜂窝网络下的上传并发上限
const CELLULAR_CONCURRENCY: usize = 1;
/// 蜂窝网络下批内派发间隔
const CELLULAR_DISPATCH_DELAY: Duration = Duration::from_millis(500);
/// 单个上传的默认超时
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// 入队参数
#[derive(Debug, Clone)]
pub struct EnqueueMediaOptions {
    /// 父日志服务端 ID（创建已同步时）
    pub log_id: Option<String>,
    /// 父日志本地 ID（配合 ID 映射解析）
    pub local_log_id: Option<String>,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub media_type: MediaType,
    pub bytes_total: i64,
    /// 未指定时视频默认仅 Wi-Fi
    pub wifi_only: Option<bool>,
}

/// 一次队列处理的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaQueueOutcome {
    pub uploaded: usize,
    /// 因仅 Wi-Fi 限制被跳过的条数（状态不动）
    pub skipped: usize,
    pub failed: usize,
}

/// 媒体上传队列
#[derive(Debug)]
pub struct MediaUploadQueue {
    store: OfflineStore,
    api: Arc<dyn RemoteApi>,
    network: Arc<NetworkMonitor>,
    /// 进程内重入保护，重叠调用直接返回空结果
    running: AtomicBool,
    upload_timeout: Duration,
}

impl MediaUploadQueue {
    pub fn new(store: OfflineStore, api: Arc<dyn RemoteApi>, network: Arc<NetworkMonitor>) -> Self {
        Self {
            store,
            api,
            network,
            running: AtomicBool::new(false),
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// 入队一条媒体上传：占位 outbox 行 + 跟踪行，一次落两条
    pub async fn enqueue_media(&self, opts: EnqueueMediaOptions) -> Result<String> {
        let wifi_only = opts.wifi_only.unwrap_or(opts.media_type == MediaType::Video);
        let observed_tier = self.network.state().await.tier;

        let media_id = new_media_id();
        let outbox_id = self
            .store
            .outbox()
            .enqueue(&OutboxPayload::MediaUpload { media_id: media_id.clone() })
            .await?;

        self.store
            .media()
            .insert(&NewMediaUpload {
                id: media_id.clone(),
                outbox_id,
                log_id: opts.log_id,
                local_log_id: opts.local_log_id,
                file_path: opts.file_path,
                file_name: opts.file_name,
                mime_type: opts.mime_type,
                media_type: opts.media_type,
                bytes_total: opts.bytes_total,
                wifi_only,
                observed_tier,
            })
            .await?;

        Ok(media_id)
    }

    /// 队列状态（纯读）
    pub async fn queue_status(&self) -> Result<MediaQueueStatus> {
        self.store.media().queue_status().await
    }

    /// 上传历史（新的在前）
    pub async fn history(&self, limit: usize) -> Result<Vec<MediaUploadItem>> {
        self.store.media().history(limit).await
    }

    /// 处理一批待上传行
    ///
    /// 重叠调用返回零结果，批次层面总是 Ok。
    pub async fn process(&self) -> Result<MediaQueueOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("媒体队列已在处理中，跳过");
            return Ok(MediaQueueOutcome::default());
        }

        let result = self.process_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn process_inner(&self) -> Result<MediaQueueOutcome> {
        let state = self.network.state().await;
        if !state.connected {
            debug!("离线，跳过媒体上传");
            return Ok(MediaQueueOutcome::default());
        }

        let items = self.store.media().list_eligible(MEDIA_BATCH_LIMIT).await?;
        if items.is_empty() {
            return Ok(MediaQueueOutcome::default());
        }

        let (concurrency, dispatch_delay) = match state.tier {
            NetworkTier::Wifi => (WIFI_CONCURRENCY, None),
            NetworkTier::Cellular => (CELLULAR_CONCURRENCY, Some(CELLULAR_DISPATCH_DELAY)),
        };

        info!("开始处理媒体队列: {} 条, 并发 {}", items.len(), concurrency);

        let mut outcome = MediaQueueOutcome::default();
        let mut workers: JoinSet<bool> = JoinSet::new();

        for item in items {
            if item.wifi_only && state.tier != NetworkTier::Wifi {
                // 状态不动，等 Wi-Fi 环境再试
                outcome.skipped += 1;
                continue;
            }

            // 工作集满时等一个槽位
            while workers.len() >= concurrency {
                if let Some(joined) = workers.join_next().await {
                    Self::fold_result(&mut outcome, joined);
                }
            }

            let store = self.store.clone();
            let api = self.api.clone();
            let timeout = self.upload_timeout;
            workers.spawn(async move { Self::upload_one(store, api, item, timeout).await });

            if let Some(delay) = dispatch_delay {
                tokio::time::sleep(delay).await;
            }
        }

        while let Some(joined) = workers.join_next().await {
            Self::fold_result(&mut outcome, joined);
        }

        if outcome.uploaded > 0 || outcome.failed > 0 {
            info!(
                "✅ 媒体队列处理完成: 上传 {} 条, 跳过 {} 条, 失败 {} 条",
                outcome.uploaded, outcome.skipped, outcome.failed
            );
        }
        Ok(outcome)
    }

    fn fold_result(outcome: &mut MediaQueueOutcome, joined: std::result::Result<bool, tokio::task::JoinError>) {
        match joined {
            Ok(true) => outcome.uploaded += 1,
            Ok(false) => outcome.failed += 1,
            Err(e) => {
                warn!("上传任务异常退出: {}", e);
                outcome.failed += 1;
            }
        }
    }

    /// 上传单条媒体，返回是否成功
    ///
    /// 成功/失败都同步回写媒体行和占位 outbox 行。
    async fn upload_one(
        store: OfflineStore,
        api: Arc<dyn RemoteApi>,
        item: MediaUploadItem,
        timeout: Duration,
    ) -> bool {
        if let Err(e) = store.media().mark_uploading(&item.id).await {
            warn!("标记上传中失败: id={}, {}", item.id, e);
            return false;
        }
        if let Err(e) = store.outbox().mark_processing(&item.outbox_id).await {
            warn!("标记占位行失败: id={}, {}", item.outbox_id, e);
        }

        match Self::try_upload(&store, api.as_ref(), &item, timeout).await {
            Ok(()) => {
                let mut ok = true;
                if let Err(e) = store.media().mark_done(&item.id).await {
                    warn!("标记上传完成失败: id={}, {}", item.id, e);
                    ok = false;
                }
                if let Err(e) = store.outbox().mark_done(&item.outbox_id).await {
                    warn!("标记占位行完成失败: id={}, {}", item.outbox_id, e);
                }
                ok
            }
            Err(e) => {
                let message = e.to_string();
                warn!("媒体上传失败: id={}, {}", item.id, message);
                if let Err(e) = store.media().mark_error(&item.id).await {
                    warn!("标记上传错误失败: id={}, {}", item.id, e);
                }
                if let Err(e) = store.outbox().mark_error(&item.outbox_id, &message).await {
                    warn!("标记占位行错误失败: id={}, {}", item.outbox_id, e);
                }
                false
            }
        }
    }

    async fn try_upload(
        store: &OfflineStore,
        api: &dyn RemoteApi,
        item: &MediaUploadItem,
        timeout: Duration,
    ) -> Result<()> {
        let path = Path::new(&item.file_path);
        if tokio::fs::metadata(path).await.is_err() {
            return Err(FieldSyncError::NotFound(format!("本地文件不存在: {}", item.file_path)));
        }

        let parent = SyncEngine::resolve_parent_log_id(
            store,
            item.log_id.as_deref(),
            item.local_log_id.as_deref(),
        )
        .await?;

        tokio::time::timeout(
            timeout,
            api.upload_attachment(&parent, path, &item.file_name, &item.mime_type),
        )
        .await
        .map_err(|_| FieldSyncError::Transport(format!("上传超时 ({}s)", timeout.as_secs())))??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_helpers::MockRemoteApi;
    use crate::network::test_helpers::ManualNetworkListener;
    use crate::network::NetworkState;
    use crate::storage::media::MediaUploadStatus;
    use crate::storage::outbox::OutboxStatus;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        files: TempDir,
        store: OfflineStore,
        api: Arc<MockRemoteApi>,
        network: Arc<NetworkMonitor>,
        queue: Arc<MediaUploadQueue>,
    }

    async fn fixture_with(state: NetworkState) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = OfflineStore::open(&dir.path().join("offline.db")).await.unwrap();
        let api = Arc::new(MockRemoteApi::new());
        let network = Arc::new(NetworkMonitor::new(Arc::new(ManualNetworkListener::default())));
        network.set_state(state).await;

        let queue = Arc::new(MediaUploadQueue::new(
            store.clone(),
            api.clone() as Arc<dyn RemoteApi>,
            network.clone(),
        ));

        Fixture { _dir: dir, files: TempDir::new().unwrap(), store, api, network, queue }
    }

    async fn enqueue_photo(fx: &Fixture, name: &str) -> String {
        let path = fx.files.path().join(name);
        tokio::fs::write(&path, b"bytes").await.unwrap();
        fx.queue
            .enqueue_media(EnqueueMediaOptions {
                log_id: Some("srv_1".into()),
                local_log_id: None,
                file_path: path.to_string_lossy().into_owned(),
                file_name: name.to_string(),
                mime_type: "image/jpeg".into(),
                media_type: MediaType::Photo,
                bytes_total: 5,
                wifi_only: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_pairs_outbox_placeholder() {
        let fx = fixture_with(NetworkState::wifi()).await;
        let media_id = enqueue_photo(&fx, "a.jpg").await;

        let item = fx.store.media().get(&media_id).await.unwrap().unwrap();
        assert_eq!(item.status, MediaUploadStatus::Queued);
        assert!(!item.wifi_only);

        let outbox_item = fx.store.outbox().get(&item.outbox_id).await.unwrap().unwrap();
        assert_eq!(outbox_item.item_type, "media.upload");
        assert_eq!(outbox_item.status, OutboxStatus::Pending);
        let payload: OutboxPayload = serde_json::from_str(&outbox_item.payload).unwrap();
        assert_eq!(payload, OutboxPayload::MediaUpload { media_id });
    }

    #[tokio::test]
    async fn test_video_defaults_to_wifi_only() {
        let fx = fixture_with(NetworkState::wifi()).await;
        let path = fx.files.path().join("clip.mp4");
        tokio::fs::write(&path, b"video").await.unwrap();

        let media_id = fx
            .queue
            .enqueue_media(EnqueueMediaOptions {
                log_id: Some("srv_1".into()),
                local_log_id: None,
                file_path: path.to_string_lossy().into_owned(),
                file_name: "clip.mp4".into(),
                mime_type: "video/mp4".into(),
                media_type: MediaType::Video,
                bytes_total: 5,
                wifi_only: None,
            })
            .await
            .unwrap();

        let item = fx.store.media().get(&media_id).await.unwrap().unwrap();
        assert!(item.wifi_only);
    }

    #[tokio::test]
    async fn test_process_uploads_and_keeps_lockstep() {
        let fx = fixture_with(NetworkState::wifi()).await;
        let media_id = enqueue_photo(&fx, "a.jpg").await;

        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome, MediaQueueOutcome { uploaded: 1, skipped: 0, failed: 0 });

        let item = fx.store.media().get(&media_id).await.unwrap().unwrap();
        assert_eq!(item.status, MediaUploadStatus::Done);
        assert_eq!(item.bytes_uploaded, item.bytes_total);
        let outbox_item = fx.store.outbox().get(&item.outbox_id).await.unwrap().unwrap();
        assert_eq!(outbox_item.status, OutboxStatus::Done);
    }

    #[tokio::test]
    async fn test_offline_returns_zero_outcome() {
        let fx = fixture_with(NetworkState::offline()).await;
        enqueue_photo(&fx, "a.jpg").await;

        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome, MediaQueueOutcome::default());
        assert!(fx.api.call_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_wifi_only_rows_skipped_on_cellular() {
        let fx = fixture_with(NetworkState::cellular()).await;

        let path = fx.files.path().join("clip.mp4");
        tokio::fs::write(&path, b"video").await.unwrap();
        let video_id = fx
            .queue
            .enqueue_media(EnqueueMediaOptions {
                log_id: Some("srv_1".into()),
                local_log_id: None,
                file_path: path.to_string_lossy().into_owned(),
                file_name: "clip.mp4".into(),
                mime_type: "video/mp4".into(),
                media_type: MediaType::Video,
                bytes_total: 5,
                wifi_only: None,
            })
            .await
            .unwrap();
        let photo_id = enqueue_photo(&fx, "a.jpg").await;

        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome, MediaQueueOutcome { uploaded: 1, skipped: 1, failed: 0 });

        // 视频行原地等 Wi-Fi，照片走蜂窝
        let video = fx.store.media().get(&video_id).await.unwrap().unwrap();
        assert_eq!(video.status, MediaUploadStatus::Queued);
        let photo = fx.store.media().get(&photo_id).await.unwrap().unwrap();
        assert_eq!(photo.status, MediaUploadStatus::Done);

        // Wi-Fi 恢复后视频上传
        fx.network.set_state(NetworkState::wifi()).await;
        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome.uploaded, 1);
        let video = fx.store.media().get(&video_id).await.unwrap().unwrap();
        assert_eq!(video.status, MediaUploadStatus::Done);
    }

    #[tokio::test]
    async fn test_wifi_concurrency_capped_at_three() {
        let fx = fixture_with(NetworkState::wifi()).await;
        fx.api.set_upload_delay(Duration::from_millis(50)).await;

        for i in 0..6 {
            enqueue_photo(&fx, &format!("p{}.jpg", i)).await;
        }

        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome.uploaded, 6);
        let peak = fx.api.observed_max_concurrency();
        assert!(peak <= WIFI_CONCURRENCY, "peak {} exceeds cap", peak);
        assert!(peak >= 2, "expected overlapping uploads, peak {}", peak);
    }

    #[tokio::test]
    async fn test_cellular_is_serial() {
        let fx = fixture_with(NetworkState::cellular()).await;
        fx.api.set_upload_delay(Duration::from_millis(20)).await;

        enqueue_photo(&fx, "a.jpg").await;
        enqueue_photo(&fx, "b.jpg").await;

        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome.uploaded, 2);
        assert_eq!(fx.api.observed_max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_marks_error_pair() {
        let fx = fixture_with(NetworkState::wifi()).await;
        let media_id = fx
            .queue
            .enqueue_media(EnqueueMediaOptions {
                log_id: Some("srv_1".into()),
                local_log_id: None,
                file_path: "/nonexistent/gone.jpg".into(),
                file_name: "gone.jpg".into(),
                mime_type: "image/jpeg".into(),
                media_type: MediaType::Photo,
                bytes_total: 5,
                wifi_only: None,
            })
            .await
            .unwrap();

        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome.failed, 1);

        let item = fx.store.media().get(&media_id).await.unwrap().unwrap();
        assert_eq!(item.status, MediaUploadStatus::Error);
        let outbox_item = fx.store.outbox().get(&item.outbox_id).await.unwrap().unwrap();
        assert_eq!(outbox_item.status, OutboxStatus::Error);
        assert!(outbox_item.last_error.as_deref().unwrap().contains("本地文件不存在"));
        assert!(fx.api.call_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_parent_waits() {
        let fx = fixture_with(NetworkState::wifi()).await;
        let path = fx.files.path().join("a.jpg");
        tokio::fs::write(&path, b"bytes").await.unwrap();

        let media_id = fx
            .queue
            .enqueue_media(EnqueueMediaOptions {
                log_id: None,
                local_log_id: Some("local_5".into()),
                file_path: path.to_string_lossy().into_owned(),
                file_name: "a.jpg".into(),
                mime_type: "image/jpeg".into(),
                media_type: MediaType::Photo,
                bytes_total: 5,
                wifi_only: None,
            })
            .await
            .unwrap();

        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome.failed, 1);
        let item = fx.store.media().get(&media_id).await.unwrap().unwrap();
        assert_eq!(item.status, MediaUploadStatus::Error);

        // 映射落地后重试成功
        fx.store.kv().set_id_mapping("daily_log", "local_5", "srv_9").await.unwrap();
        let outcome = fx.queue.process().await.unwrap();
        assert_eq!(outcome.uploaded, 1);
    }

    #[tokio::test]
    async fn test_overlapping_process_returns_zero() {
        let fx = fixture_with(NetworkState::wifi()).await;
        fx.api.set_upload_delay(Duration::from_millis(100)).await;
        enqueue_photo(&fx, "a.jpg").await;

        let queue = fx.queue.clone();
        let first = tokio::spawn(async move { queue.process().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = fx.queue.process().await.unwrap();
        assert_eq!(second, MediaQueueOutcome::default());

        let first = first.await.unwrap();
        assert_eq!(first.uploaded, 1);
    }

    #[tokio::test]
    async fn test_upload_timeout_marks_error() {
        let fx = fixture_with(NetworkState::wifi()).await;
        let queue = MediaUploadQueue::new(
            fx.store.clone(),
            fx.api.clone() as Arc<dyn RemoteApi>,
            fx.network.clone(),
        )
        .with_upload_timeout(Duration::from_millis(20));

        fx.api.set_upload_delay(Duration::from_millis(200)).await;
        let media_id = enqueue_photo(&fx, "slow.jpg").await;

        let outcome = queue.process().await.unwrap();
        assert_eq!(outcome.failed, 1);
        let item = fx.store.media().get(&media_id).await.unwrap().unwrap();
        assert_eq!(item.status, MediaUploadStatus::Error);
    }
}
