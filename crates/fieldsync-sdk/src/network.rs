//! 网络状态感知
//!
//! 由平台层（Android/iOS）实现 `NetworkStatusListener`，核心只关心两件事：
//! - 是否联网（决定是否尝试同步）
//! - 网络档位 Wifi / Cellular（决定上传并发与节流）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;

/// 网络档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkTier {
    /// Wi-Fi（不限流量）
    Wifi,
    /// 蜂窝网络（按量计费，上传节流）
    Cellular,
}

/// 网络状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    pub tier: NetworkTier,
}

impl NetworkState {
    pub fn offline() -> Self {
        Self { connected: false, tier: NetworkTier::Cellular }
    }

    pub fn wifi() -> Self {
        Self { connected: true, tier: NetworkTier::Wifi }
    }

    pub fn cellular() -> Self {
        Self { connected: true, tier: NetworkTier::Cellular }
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStateEvent {
    pub old_state: NetworkState,
    pub new_state: NetworkState,
}

/// 网络状态监听器trait（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn current_state(&self) -> NetworkState;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStateEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
///
/// 把平台层事件转换成内部广播，并维护一份当前状态快照。
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    state_sender: broadcast::Sender<NetworkStateEvent>,
    current_state: Arc<tokio::sync::RwLock<NetworkState>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (state_sender, _) = broadcast::channel(100);

        Self {
            listener,
            state_sender,
            current_state: Arc::new(tokio::sync::RwLock::new(NetworkState::offline())),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.current_state().await;
        *self.current_state.write().await = initial;

        let mut receiver = self.listener.start_monitoring().await?;
        let state_sender = self.state_sender.clone();
        let current_state = self.current_state.clone();

        // 转发平台层事件
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                {
                    let mut state = current_state.write().await;
                    *state = event.new_state;
                }
                let _ = state_sender.send(event);
            }
        });

        Ok(())
    }

    /// 获取当前网络状态快照
    pub async fn state(&self) -> NetworkState {
        *self.current_state.read().await
    }

    /// 手动设置网络状态（测试及平台回调注入用）
    pub async fn set_state(&self, new_state: NetworkState) {
        let old_state = {
            let mut state = self.current_state.write().await;
            let old = *state;
            *state = new_state;
            old
        };

        let _ = self.state_sender.send(NetworkStateEvent { old_state, new_state });
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStateEvent> {
        self.state_sender.subscribe()
    }

    /// 当前是否联网
    pub async fn is_connected(&self) -> bool {
        self.state().await.connected
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::ManualNetworkListener;
    use super::*;

    #[tokio::test]
    async fn test_monitor_tracks_listener_events() {
        let listener = Arc::new(ManualNetworkListener::new(NetworkState::cellular()));
        let monitor = NetworkMonitor::new(listener.clone());

        monitor.start().await.unwrap();
        assert_eq!(monitor.state().await, NetworkState::cellular());

        let mut rx = monitor.subscribe();
        listener.switch_to(NetworkState::wifi()).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.old_state, NetworkState::cellular());
        assert_eq!(event.new_state, NetworkState::wifi());
        assert_eq!(monitor.state().await, NetworkState::wifi());
    }

    #[tokio::test]
    async fn test_manual_set_state_broadcasts() {
        let listener = Arc::new(ManualNetworkListener::default());
        let monitor = NetworkMonitor::new(listener);

        let mut rx = monitor.subscribe();
        monitor.set_state(NetworkState::offline()).await;

        let event = rx.recv().await.unwrap();
        assert!(!event.new_state.connected);
        assert!(!monitor.is_connected().await);
    }
}
