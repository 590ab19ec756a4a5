use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 请求体校验失败的原因。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("请求 JSON 解析失败: {0}")]
    MalformedBody(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("size is invalid: {0:?}")]
    InvalidSize(String),

    #[error("duration is invalid: {0}")]
    InvalidDuration(i64),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("配置错误: {message}")]
    Config { code: &'static str, message: String },

    #[error("用户额度不足, 剩余额度: {balance}, 需要额度: {need}")]
    InsufficientQuota { balance: String, need: String },

    #[error("请求转换失败: {0}")]
    Conversion(String),

    #[error("上游请求失败: {0}")]
    Transport(String),

    #[error("{message}")]
    Upstream {
        status: u16,
        code: String,
        message: String,
    },

    #[error("任务记录失败: {0}")]
    Persistence(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    code: String,
}

impl RelayError {
    pub fn config(code: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn upstream(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// 稳定的错误类别标签（写入响应体 `error.type`）。
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Config { .. } => "config_error",
            Self::InsufficientQuota { .. } => "insufficient_user_quota",
            Self::Conversion(_) => "conversion_error",
            Self::Transport(_) => "transport_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Persistence(_) => "persistence_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// 更细粒度的错误码（写入响应体 `error.code`）。
    pub fn code(&self) -> String {
        match self {
            Self::Validation(_) => "invalid_video_request".to_string(),
            Self::Config { code, .. } => (*code).to_string(),
            Self::Upstream { code, .. } => code.clone(),
            Self::Persistence(_) => "task_insert_failed".to_string(),
            _ => String::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientQuota { .. } => StatusCode::FORBIDDEN,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Config { .. }
            | Self::Conversion(_)
            | Self::Transport(_)
            | Self::Persistence(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        sonic_rs::to_vec(&self.body()).unwrap_or_default()
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorBodyInner {
                message: format!("{self:#}"),
                r#type: self.kind(),
                code: self.code(),
            },
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
