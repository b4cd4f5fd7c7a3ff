//! 远端接口模块
//!
//! 同步引擎与上传队列通过 `RemoteApi` trait 访问服务端，
//! 生产实现 `HttpRemoteApi` 基于 reqwest：
//! - JSON 变更接口（日志/库存/工时）
//! - multipart 附件上传
//! - Bearer 令牌来自 `SessionProvider`

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{FieldSyncError, Result};
use crate::session::SessionProvider;

/// 远端接口配置
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// 服务端基础 URL
    pub base_url: String,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 普通请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.fieldsync.example.com".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

/// 附件上传响应
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AttachmentUploadResponse {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// 远端接口trait
///
/// 所有变更接口接收/返回 `serde_json::Value`，服务端契约由宿主应用维护。
#[async_trait]
pub trait RemoteApi: Send + Sync + std::fmt::Debug {
    /// 创建日志，返回包含服务端 `id` 的对象
    async fn create_daily_log(&self, payload: &Value) -> Result<Value>;

    /// 更新已有日志
    async fn update_daily_log(&self, server_id: &str, payload: &Value) -> Result<Value>;

    /// 拉取项目下的日志列表（用于缓存刷新）
    async fn list_daily_logs(&self, project_id: &str) -> Result<Value>;

    /// 附件上传（multipart）
    async fn upload_attachment(
        &self,
        daily_log_server_id: &str,
        file_path: &Path,
        file_name: &str,
        mime_type: &str,
    ) -> Result<AttachmentUploadResponse>;

    /// 资产移动
    async fn move_asset(&self, payload: &Value) -> Result<Value>;

    /// 拉取某位置的库存持有（用于缓存刷新）
    async fn location_holdings(&self, location_id: &str) -> Result<Value>;

    /// 提交范围数量标记
    async fn submit_quantity_flags(&self, payload: &Value) -> Result<Value>;

    /// 批量提交完成度百分比
    async fn submit_percent_edits(&self, payload: &Value) -> Result<Value>;

    /// 上班打卡
    async fn clock_in(&self, payload: &Value) -> Result<Value>;

    /// 下班打卡
    async fn clock_out(&self, payload: &Value) -> Result<Value>;

    /// 当前打卡状态（用于缓存刷新）
    async fn timecard_status(&self) -> Result<Value>;

    /// 近期工时记录（用于缓存刷新）
    async fn timecard_recent(&self) -> Result<Value>;
}

pub type SharedRemoteApi = Arc<dyn RemoteApi>;

/// 基于 reqwest 的远端接口实现
#[derive(Debug)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpRemoteApi {
    pub fn new(config: &ApiConfig, session: Arc<dyn SessionProvider>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FieldSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ 远端接口客户端已创建 (base_url: {})", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 统一的状态码检查与响应解析
    async fn parse_response(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 请求失败，HTTP 状态码: {}, 错误: {}", status, error_text);
            if status == StatusCode::UNAUTHORIZED {
                return Err(FieldSyncError::Auth(error_text));
            }
            return Err(FieldSyncError::Api { status: status.as_u16(), message: error_text });
        }

        response
            .json()
            .await
            .map_err(|e| FieldSyncError::Serialization(format!("解析响应失败: {}", e)))
    }

    async fn post_json(&self, path: &str, payload: &Value) -> Result<Value> {
        let token = self.session.access_token().await?;
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("请求失败: {}", e)))?;
        Self::parse_response(response).await
    }

    async fn patch_json(&self, path: &str, payload: &Value) -> Result<Value> {
        let token = self.session.access_token().await?;
        let response = self
            .client
            .patch(self.url(path))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("请求失败: {}", e)))?;
        Self::parse_response(response).await
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let token = self.session.access_token().await?;
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("请求失败: {}", e)))?;
        Self::parse_response(response).await
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create_daily_log(&self, payload: &Value) -> Result<Value> {
        self.post_json("/api/daily-logs", payload).await
    }

    async fn update_daily_log(&self, server_id: &str, payload: &Value) -> Result<Value> {
        self.patch_json(&format!("/api/daily-logs/{}", server_id), payload).await
    }

    async fn list_daily_logs(&self, project_id: &str) -> Result<Value> {
        self.get_json(&format!("/api/projects/{}/daily-logs", project_id)).await
    }

    async fn upload_attachment(
        &self,
        daily_log_server_id: &str,
        file_path: &Path,
        file_name: &str,
        mime_type: &str,
    ) -> Result<AttachmentUploadResponse> {
        let file_size = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| FieldSyncError::IO(format!("读取文件元数据失败: {}", e)))?
            .len();

        info!("📤 开始上传附件: {} ({} bytes)", file_path.display(), file_size);

        let file_data = tokio::fs::read(file_path)
            .await
            .map_err(|e| FieldSyncError::IO(format!("读取文件失败: {}", e)))?;

        let part = multipart::Part::bytes(file_data)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| FieldSyncError::Other(format!("创建 multipart part 失败: {}", e)))?;

        let form = multipart::Form::new().part("file", part);

        let token = self.session.access_token().await?;
        let response = self
            .client
            .post(self.url(&format!("/api/daily-logs/{}/attachments", daily_log_server_id)))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| FieldSyncError::Transport(format!("上传附件失败: {}", e)))?;

        let value = Self::parse_response(response).await?;
        let result: AttachmentUploadResponse = serde_json::from_value(value)
            .map_err(|e| FieldSyncError::Serialization(format!("解析上传响应失败: {}", e)))?;

        info!("✅ 附件上传成功: id={}, url={}", result.id, result.url);
        Ok(result)
    }

    async fn move_asset(&self, payload: &Value) -> Result<Value> {
        self.post_json("/api/inventory/moves", payload).await
    }

    async fn location_holdings(&self, location_id: &str) -> Result<Value> {
        self.get_json(&format!("/api/inventory/locations/{}/holdings", location_id)).await
    }

    async fn submit_quantity_flags(&self, payload: &Value) -> Result<Value> {
        self.post_json("/api/scopes/quantity-flags", payload).await
    }

    async fn submit_percent_edits(&self, payload: &Value) -> Result<Value> {
        self.post_json("/api/scopes/percent-edits", payload).await
    }

    async fn clock_in(&self, payload: &Value) -> Result<Value> {
        self.post_json("/api/timecards/clock-in", payload).await
    }

    async fn clock_out(&self, payload: &Value) -> Result<Value> {
        self.post_json("/api/timecards/clock-out", payload).await
    }

    async fn timecard_status(&self) -> Result<Value> {
        self.get_json("/api/timecards/status").await
    }

    async fn timecard_recent(&self) -> Result<Value> {
        self.get_json("/api/timecards/recent").await
    }
}
