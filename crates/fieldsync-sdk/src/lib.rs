//! FieldSync SDK - 离线优先的移动端变更同步核心
//!
//! 为现场作业类应用提供"先落盘、后同步"的能力：
//! - 变更队列：所有写操作先进 SQLite outbox，联网后按序派发
//! - ID 回填：本地乐观 ID 在创建同步后映射到服务端 ID
//! - 媒体上传：独立队列，按网络档位限并发、可选仅 Wi-Fi
//! - 自动调度：网络恢复 / 周期 / 前台触发，带去抖
//! - 读缓存与使用记录：列表缓存 cache-aside，项目按近期活跃度排序
//!
//! # 快速开始
//!
//! ```ignore
//! let store = OfflineStore::open(Path::new("/data/app/offline.db")).await?;
//! let network = Arc::new(NetworkMonitor::new(platform_listener));
//! let api = Arc::new(HttpRemoteApi::new(&ApiConfig::default(), session.clone())?);
//!
//! let media_queue = Arc::new(MediaUploadQueue::new(store.clone(), api.clone(), network.clone()));
//! let engine = Arc::new(SyncEngine::new(store.clone(), api, session, network.clone(), media_queue));
//!
//! let scheduler = AutoSyncScheduler::new(engine, store, network, SchedulerConfig::default());
//! scheduler.start().await?;
//! ```

pub mod api;
pub mod error;
pub mod network;
pub mod payload;
pub mod session;
pub mod storage;
pub mod sync;

pub use api::{ApiConfig, AttachmentUploadResponse, HttpRemoteApi, RemoteApi, SharedRemoteApi};
pub use error::{FieldSyncError, Result};
pub use network::{NetworkMonitor, NetworkState, NetworkStatusListener, NetworkTier};
pub use payload::{MediaType, OutboxPayload};
pub use session::{SessionProvider, SharedSessionProvider};
pub use storage::{
    CacheStore, KvStore, MediaQueueStatus, MediaStore, MediaUploadItem, MediaUploadStatus,
    OfflineStore, OutboxItem, OutboxStatus, OutboxStore, ProjectScore, UsageAction, UsageTracker,
};
pub use sync::{
    AutoSyncScheduler, EnqueueMediaOptions, MediaQueueOutcome, MediaUploadQueue, SchedulerConfig,
    SyncEngine, SyncOutcome,
};
