//! 自动同步调度器
//!
//! 单个常驻任务驱动同步时机：
//! - 网络从断开恢复到联网
//! - 周期轮询（默认 60 秒）
//! - 宿主触发（回到前台 / 手动）
//!
//! 相邻两次实际同步之间有去抖间隔（默认 5 秒），
//! 同步本身的错误只记日志，不向宿主传播。

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::network::NetworkMonitor;
use crate::storage::OfflineStore;
use crate::sync::engine::SyncEngine;

/// 调度配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 两次实际同步之间的最小间隔
    pub debounce: Duration,
    /// 周期轮询间隔
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// 自动同步调度器
#[derive(Debug)]
pub struct AutoSyncScheduler {
    engine: Arc<SyncEngine>,
    store: OfflineStore,
    network: Arc<NetworkMonitor>,
    config: SchedulerConfig,
    is_running: Arc<RwLock<bool>>,
    shutdown: Arc<Notify>,
    trigger_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    last_sync_at: Arc<Mutex<Option<Instant>>>,
}

impl AutoSyncScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        store: OfflineStore,
        network: Arc<NetworkMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            network,
            config,
            is_running: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
            trigger_tx: Mutex::new(None),
            last_sync_at: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// 启动驱动任务（幂等）
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                debug!("调度器已在运行");
                return Ok(());
            }
            *running = true;
        }

        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<String>();
        *self.trigger_tx.lock() = Some(trigger_tx);

        let engine = self.engine.clone();
        let store = self.store.clone();
        let mut net_rx = self.network.subscribe();
        let shutdown = self.shutdown.clone();
        let is_running = self.is_running.clone();
        let last_sync_at = self.last_sync_at.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            info!("🚀 自动同步调度器已启动");

            // 启动即尝试一次，消化离线期间积压的变更
            Self::attempt(&engine, &store, &last_sync_at, config.debounce, "startup").await;

            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // 首个 tick 立即返回，丢弃

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::attempt(&engine, &store, &last_sync_at, config.debounce, "interval").await;
                    }
                    event = net_rx.recv() => {
                        match event {
                            Ok(event) => {
                                if !event.old_state.connected && event.new_state.connected {
                                    Self::attempt(&engine, &store, &last_sync_at, config.debounce, "network-restored").await;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                debug!("网络事件滞后 {} 条", n);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                break;
                            }
                        }
                    }
                    trigger = trigger_rx.recv() => {
                        match trigger {
                            Some(reason) => {
                                Self::attempt(&engine, &store, &last_sync_at, config.debounce, &reason).await;
                            }
                            None => break,
                        }
                    }
                }
            }

            *is_running.write().await = false;
            info!("自动同步调度器已停止");
        });

        Ok(())
    }

    /// 停止驱动任务（幂等）
    pub async fn stop(&self) {
        if !*self.is_running.read().await {
            return;
        }
        *self.trigger_tx.lock() = None;
        self.shutdown.notify_waiters();
    }

    /// 手动触发一次同步尝试
    pub fn trigger(&self, reason: &str) {
        if let Some(tx) = self.trigger_tx.lock().as_ref() {
            let _ = tx.send(reason.to_string());
        }
    }

    /// 宿主通知应用回到前台
    pub fn notify_foreground(&self) {
        self.trigger("foreground");
    }

    /// 一次同步尝试：去抖 → 轻量前置检查 → 同步
    async fn attempt(
        engine: &SyncEngine,
        store: &OfflineStore,
        last_sync_at: &Mutex<Option<Instant>>,
        debounce: Duration,
        reason: &str,
    ) {
        // 前置检查不过不消耗去抖窗口
        match engine.policy_block_reason().await {
            Ok(None) => {}
            Ok(Some(block)) => {
                debug!("同步被策略拦截 ({}): {}", reason, block);
                return;
            }
            Err(e) => {
                warn!("同步策略检查失败: {}", e);
                return;
            }
        }

        let has_work = match Self::has_pending_work(store).await {
            Ok(v) => v,
            Err(e) => {
                warn!("检查待同步数量失败: {}", e);
                return;
            }
        };
        if !has_work {
            debug!("没有待同步的变更 ({})", reason);
            return;
        }

        {
            let mut last = last_sync_at.lock();
            if let Some(at) = *last {
                if at.elapsed() < debounce {
                    debug!("同步去抖 ({})", reason);
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        info!("触发同步: {}", reason);
        match engine.sync_once().await {
            Ok(outcome) => {
                debug!(
                    "同步结果 ({}): 成功 {} 条, 失败 {} 条",
                    reason, outcome.processed, outcome.failed
                );
            }
            Err(e) => warn!("同步执行失败 ({}): {}", reason, e),
        }
    }

    async fn has_pending_work(store: &OfflineStore) -> Result<bool> {
        if store.outbox().count_eligible().await? > 0 {
            return Ok(true);
        }
        Ok(store.media().count_eligible().await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_helpers::MockRemoteApi;
    use crate::api::RemoteApi;
    use crate::network::test_helpers::ManualNetworkListener;
    use crate::network::NetworkState;
    use crate::payload::OutboxPayload;
    use crate::session::test_helpers::StaticSessionProvider;
    use crate::sync::media_queue::MediaUploadQueue;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: OfflineStore,
        api: Arc<MockRemoteApi>,
        network: Arc<NetworkMonitor>,
        scheduler: AutoSyncScheduler,
    }

    async fn fixture_with(state: NetworkState, config: SchedulerConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = OfflineStore::open(&dir.path().join("offline.db")).await.unwrap();
        let api = Arc::new(MockRemoteApi::new());
        let network = Arc::new(NetworkMonitor::new(Arc::new(ManualNetworkListener::default())));
        network.set_state(state).await;

        let media_queue = Arc::new(MediaUploadQueue::new(
            store.clone(),
            api.clone() as Arc<dyn RemoteApi>,
            network.clone(),
        ));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            api.clone() as Arc<dyn RemoteApi>,
            Arc::new(StaticSessionProvider::logged_in("token")),
            network.clone(),
            media_queue,
        ));
        let scheduler = AutoSyncScheduler::new(engine, store.clone(), network.clone(), config);

        Fixture { _dir: dir, store, api, network, scheduler }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(10),
            poll_interval: Duration::from_secs(300),
        }
    }

    async fn wait_until_drained(store: &OfflineStore) {
        for _ in 0..100 {
            if store.outbox().count_eligible().await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue never drained");
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_fires_initial_sync() {
        let fx = fixture_with(NetworkState::wifi(), fast_config()).await;
        fx.store
            .outbox()
            .enqueue(&OutboxPayload::ClockIn { body: json!({}) })
            .await
            .unwrap();

        fx.scheduler.start().await.unwrap();
        fx.scheduler.start().await.unwrap();
        assert!(fx.scheduler.is_running().await);

        wait_until_drained(&fx.store).await;
        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fx = fixture_with(NetworkState::wifi(), fast_config()).await;
        fx.scheduler.stop().await;
        assert!(!fx.scheduler.is_running().await);

        fx.scheduler.start().await.unwrap();
        fx.scheduler.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fx.scheduler.is_running().await);
        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_manual_trigger_syncs() {
        let fx = fixture_with(NetworkState::wifi(), fast_config()).await;
        fx.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.store
            .outbox()
            .enqueue(&OutboxPayload::ClockIn { body: json!({}) })
            .await
            .unwrap();
        fx.scheduler.notify_foreground();

        wait_until_drained(&fx.store).await;
        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_network_restore_triggers_sync() {
        let fx = fixture_with(NetworkState::offline(), fast_config()).await;
        fx.store
            .outbox()
            .enqueue(&OutboxPayload::ClockIn { body: json!({}) })
            .await
            .unwrap();

        fx.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // 离线期间没有派发
        assert!(fx.api.call_log().await.is_empty());

        fx.network.set_state(NetworkState::wifi()).await;
        wait_until_drained(&fx.store).await;
        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_debounce_suppresses_rapid_triggers() {
        let fx = fixture_with(
            NetworkState::wifi(),
            SchedulerConfig { debounce: Duration::from_secs(60), poll_interval: Duration::from_secs(300) },
        )
        .await;

        fx.store
            .outbox()
            .enqueue(&OutboxPayload::ClockIn { body: json!({}) })
            .await
            .unwrap();
        fx.scheduler.start().await.unwrap();
        wait_until_drained(&fx.store).await;

        // 去抖窗口内的触发不再派发
        fx.store
            .outbox()
            .enqueue(&OutboxPayload::ClockOut { body: json!({}) })
            .await
            .unwrap();
        fx.scheduler.trigger("manual");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.store.outbox().count_eligible().await.unwrap(), 1);

        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_no_work_means_no_sync_attempt() {
        let fx = fixture_with(NetworkState::wifi(), fast_config()).await;
        fx.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.scheduler.trigger("manual");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.api.call_log().await.is_empty());
        fx.scheduler.stop().await;
    }
}
