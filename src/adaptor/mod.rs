//! 上游适配器：把规范化的视频请求转换成上游请求，并把上游响应解析回任务信息。
//!
//! 编排层只通过 [`Adaptor`] 接口与上游交互，不感知具体厂商。

pub mod passthrough;

use crate::error::RelayError;
use crate::relay::context::RelayInfo;
use crate::relay::types::VideoRequest;
use crate::task::TaskPlatform;
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// 渠道的接口类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    Passthrough,
    Ali,
    Kling,
}

impl ApiType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "passthrough" | "openai" => Some(Self::Passthrough),
            "ali" | "dashscope" => Some(Self::Ali),
            "kling" => Some(Self::Kling),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Ali => "ali",
            Self::Kling => "kling",
        }
    }
}

/// 上游的原始响应。
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_event_stream(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"))
    }
}

/// 上游受理后返回的任务信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: String,
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    fn init(&mut self, info: &RelayInfo);

    fn convert_video_request(
        &self,
        info: &RelayInfo,
        req: &VideoRequest,
    ) -> anyhow::Result<serde_json::Value>;

    /// 仅在网络层失败时返回 Err；非 2xx 状态码通过 [`UpstreamResponse::status`] 返回。
    async fn do_request(&self, info: &RelayInfo, body: Vec<u8>) -> anyhow::Result<UpstreamResponse>;

    fn do_response(
        &self,
        info: &RelayInfo,
        resp: &UpstreamResponse,
    ) -> Result<TaskResponse, RelayError>;

    fn platform(&self) -> TaskPlatform;
}

type AdaptorFactory = Arc<dyn Fn() -> Box<dyn Adaptor> + Send + Sync>;

/// 按接口类型注册的适配器工厂；每次解析都返回新的实例。
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    factories: HashMap<ApiType, AdaptorFactory>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, api_type: ApiType, factory: F)
    where
        F: Fn() -> Box<dyn Adaptor> + Send + Sync + 'static,
    {
        self.factories.insert(api_type, Arc::new(factory));
    }

    pub fn resolve(&self, api_type: &str) -> Option<Box<dyn Adaptor>> {
        let api_type = ApiType::parse(api_type)?;
        self.factories.get(&api_type).map(|f| f())
    }
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.factories.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        f.debug_struct("AdaptorRegistry")
            .field("api_types", &keys)
            .finish()
    }
}

/// 把上游非 200 响应转换为 [`RelayError::Upstream`]。
///
/// 兼容两种常见错误体：`{"error":{"message","type","code"}}` 与 `{"code","message"}`。
pub fn relay_error_from_response(status: u16, body: &[u8]) -> RelayError {
    #[derive(Debug, Deserialize)]
    struct Nested {
        error: NestedInner,
    }

    #[derive(Debug, Deserialize)]
    struct NestedInner {
        #[serde(default)]
        message: String,
        #[serde(default)]
        r#type: String,
        #[serde(default)]
        code: Option<sonic_rs::Value>,
    }

    #[derive(Debug, Deserialize)]
    struct Flat {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
    }

    if let Ok(v) = sonic_rs::from_slice::<Nested>(body)
        && !v.error.message.is_empty()
    {
        let code = v
            .error
            .code
            .as_ref()
            .and_then(code_to_string)
            .unwrap_or(v.error.r#type);
        return RelayError::upstream(status, code, v.error.message);
    }

    if let Ok(v) = sonic_rs::from_slice::<Flat>(body)
        && !v.message.is_empty()
    {
        let code = v.code.as_ref().and_then(code_to_string).unwrap_or_default();
        return RelayError::upstream(status, code, v.message);
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let message = if text.is_empty() {
        format!("bad response status code {status}")
    } else {
        format!("bad response status code {status}, body: {text}")
    };
    RelayError::upstream(status, format!("bad_response_status_code_{status}"), message)
}

fn code_to_string(v: &sonic_rs::Value) -> Option<String> {
    use sonic_rs::JsonValueTrait;
    if let Some(s) = v.as_str() {
        return Some(s.to_string());
    }
    v.as_i64().map(|i| i.to_string())
}
