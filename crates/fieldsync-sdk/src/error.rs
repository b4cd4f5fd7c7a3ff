//! 错误类型定义
//!
//! 同步核心的错误分类：
//! - 存储层错误（SQLite / 序列化 / IO）
//! - 远端接口错误（网络传输 / HTTP 状态码 / 认证）
//! - 依赖未就绪（本地 ID 尚未映射到服务端 ID，可重试）

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FieldSyncError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error [{status}]: {message}")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// 依赖的前置变更尚未同步完成（如附件等待父日志创建），下次同步自动重试
    #[error("Dependency pending: {0}")]
    DependencyPending(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl FieldSyncError {
    /// 判断是否是认证失败（用于同步批次的提前中止）
    pub fn is_auth_failure(&self) -> bool {
        match self {
            FieldSyncError::Auth(_) => true,
            FieldSyncError::Api { status, .. } => *status == 401,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for FieldSyncError {
    fn from(error: serde_json::Error) -> Self {
        FieldSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FieldSyncError {
    fn from(error: std::io::Error) -> Self {
        FieldSyncError::IO(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FieldSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_classification() {
        assert!(FieldSyncError::Auth("token expired".to_string()).is_auth_failure());
        assert!(FieldSyncError::Api { status: 401, message: "Unauthorized".to_string() }.is_auth_failure());
        assert!(!FieldSyncError::Api { status: 500, message: "oops".to_string() }.is_auth_failure());
        assert!(!FieldSyncError::Transport("timeout".to_string()).is_auth_failure());
        assert!(!FieldSyncError::DependencyPending("waiting".to_string()).is_auth_failure());
    }
}
