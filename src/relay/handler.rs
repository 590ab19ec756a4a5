use super::context::{ChannelSettings, RelayContext};
use super::orchestrator::VideoRelay;
use super::types::SubmitResponse;
use crate::error::RelayError;
use crate::ledger::{Account, QuotaStore};
use crate::logging::{self, LogLevel};
use crate::task::TaskStore;
use crate::util::id;
use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// 视频路由共享的状态。
pub struct AppState {
    pub log_level: LogLevel,
    pub channel: ChannelSettings,
    pub relay: VideoRelay,
    pub accounts: Arc<dyn QuotaStore>,
    pub tasks: Arc<dyn TaskStore>,
}

pub async fn handle_video_submit(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    logging::client_request(state.log_level, method.as_str(), uri.0.path(), &headers, &body);

    let result = submit(&state, &headers, &body)
        .await
        .and_then(|out| encode(&out));
    let (status, bytes) = match result {
        Ok(bytes) => (StatusCode::OK, bytes),
        Err(e) => (e.status(), e.body_bytes()),
    };

    logging::client_response(state.log_level, status.as_u16(), start.elapsed(), &bytes);
    json_response(status, bytes)
}

async fn submit(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<SubmitResponse, RelayError> {
    let account = authenticate(state, headers).await?;
    let ctx = RelayContext {
        request_id: id::request_id(),
        user_id: account.id,
        group: account.group,
        channel: state.channel.clone(),
        start_time: Utc::now(),
    };

    let out = state.relay.relay(&ctx, body).await?;
    Ok(SubmitResponse {
        success: true,
        task_id: out.task_id,
        quota: out.quota,
    })
}

/// 查询本地记录的任务；只能查询自己提交的任务。
pub async fn handle_video_fetch(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match fetch(&state, &headers, &task_id).await {
        Ok(bytes) => json_response(StatusCode::OK, bytes),
        Err(e) => e.into_response(),
    }
}

async fn fetch(state: &AppState, headers: &HeaderMap, task_id: &str) -> Result<Vec<u8>, RelayError> {
    let account = authenticate(state, headers).await?;
    let task = state
        .tasks
        .get(task_id)
        .await?
        .filter(|t| t.user_id == account.id)
        .ok_or_else(|| RelayError::NotFound(format!("任务 {task_id} 不存在")))?;
    encode(&task)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, RelayError> {
    sonic_rs::to_vec(value)
        .map_err(|e| RelayError::Internal(anyhow::anyhow!("序列化响应失败: {e}")))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Account, RelayError> {
    let Some(key) = bearer_token(headers) else {
        return Err(RelayError::unauthorized("缺少 API Key"));
    };
    match state.accounts.find_by_key(key).await? {
        Some(a) if a.enable => Ok(a),
        Some(_) => Err(RelayError::unauthorized("账户已禁用")),
        None => Err(RelayError::unauthorized("无效的 API Key")),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let v = headers.get(AUTHORIZATION)?.to_str().ok()?.trim_start();
    let token = v
        .strip_prefix("Bearer ")
        .or_else(|| v.strip_prefix("bearer "))
        .unwrap_or(v)
        .trim();
    (!token.is_empty()).then_some(token)
}

fn json_response(status: StatusCode, bytes: Vec<u8>) -> Response {
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        bytes,
    )
        .into_response()
}
