//! 同步模块
//!
//! - engine：变更队列的逐条派发与 ID 回填
//! - media_queue：媒体上传（按网络档位限并发）
//! - scheduler：自动同步调度（网络恢复 / 周期 / 前台触发）

pub mod engine;
pub mod media_queue;
pub mod scheduler;

pub use engine::{SyncEngine, SyncOutcome};
pub use media_queue::{EnqueueMediaOptions, MediaQueueOutcome, MediaUploadQueue};
pub use scheduler::{AutoSyncScheduler, SchedulerConfig};
