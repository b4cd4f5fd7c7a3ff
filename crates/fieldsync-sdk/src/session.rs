//! 会话提供者
//!
//! 上传与同步都需要携带访问令牌，令牌的获取和刷新由宿主应用负责。
//! 核心只通过 `SessionProvider` 询问当前令牌，不做任何持久化。

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// 会话提供者trait（由宿主应用实现）
#[async_trait]
pub trait SessionProvider: Send + Sync + std::fmt::Debug {
    /// 获取当前访问令牌，未登录或刷新失败时返回 Auth 错误
    async fn access_token(&self) -> Result<String>;

    /// 当前是否持有有效会话
    async fn has_valid_session(&self) -> bool;
}

pub type SharedSessionProvider = Arc<dyn SessionProvider>;
