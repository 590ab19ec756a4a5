//! 规范格式直通适配器：上游本身接受规范化的视频请求（例如下一级中转站）。
//!
//! 请求体只替换模型名为上游模型名，不做任何厂商字段映射。

use super::{Adaptor, TaskResponse, UpstreamResponse, relay_error_from_response};
use crate::config::Config;
use crate::error::RelayError;
use crate::logging::{self, LogLevel};
use crate::relay::context::RelayInfo;
use crate::relay::types::VideoRequest;
use crate::task::TaskPlatform;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::{Duration, Instant};

const SUBMIT_PATH: &str = "/v1/video/generations";

/// 构建上游 HTTP 客户端（所有请求共享连接池）。
pub fn build_http_client(cfg: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90));

    if cfg.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
    }
    if !cfg.proxy.trim().is_empty() {
        builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim()).context("代理地址无效")?);
    }

    builder.build().context("构建上游 HTTP 客户端失败")
}

#[derive(Debug, Clone)]
pub struct PassthroughAdaptor {
    http: reqwest::Client,
    platform: TaskPlatform,
    log_level: LogLevel,
    base_url: String,
    api_key: String,
}

impl PassthroughAdaptor {
    pub fn new(http: reqwest::Client, platform: TaskPlatform, log_level: LogLevel) -> Self {
        Self {
            http,
            platform,
            log_level,
            base_url: String::new(),
            api_key: String::new(),
        }
    }

    fn submit_url(&self) -> String {
        format!("{}{SUBMIT_PATH}", self.base_url.trim_end_matches('/'))
    }

    fn build_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !self.api_key.is_empty()
            && let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
        {
            h.insert(AUTHORIZATION, v);
        }
        h
    }
}

#[async_trait]
impl Adaptor for PassthroughAdaptor {
    fn init(&mut self, info: &RelayInfo) {
        self.base_url = info.channel.base_url.trim().to_string();
        self.api_key = info.channel.api_key.trim().to_string();
    }

    fn convert_video_request(
        &self,
        info: &RelayInfo,
        req: &VideoRequest,
    ) -> anyhow::Result<serde_json::Value> {
        let mut out = req.clone();
        out.model = info.upstream_model.clone();
        serde_json::to_value(out).context("序列化视频请求失败")
    }

    async fn do_request(&self, _info: &RelayInfo, body: Vec<u8>) -> anyhow::Result<UpstreamResponse> {
        if self.base_url.is_empty() {
            anyhow::bail!("上游地址未配置");
        }
        let url = self.submit_url();
        let headers = self.build_headers();
        logging::backend_request(self.log_level, "POST", &url, &headers, &body);

        let start = Instant::now();
        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("请求上游 {url} 失败"))?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await.context("读取上游响应失败")?;
        logging::backend_response(self.log_level, status, start.elapsed(), &bytes);

        Ok(UpstreamResponse {
            status,
            headers,
            body: bytes.to_vec(),
        })
    }

    fn do_response(
        &self,
        _info: &RelayInfo,
        resp: &UpstreamResponse,
    ) -> Result<TaskResponse, RelayError> {
        parse_task_response(resp.status, &resp.body)
    }

    fn platform(&self) -> TaskPlatform {
        self.platform
    }
}

/// 从上游受理响应中提取任务 ID，兼容 `task_id` / `id` / `output.task_id`。
fn parse_task_response(status: u16, body: &[u8]) -> Result<TaskResponse, RelayError> {
    #[derive(Debug, Default, Deserialize)]
    struct Output {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        task_status: String,
    }

    #[derive(Debug, Deserialize)]
    struct SubmitResp {
        #[serde(default)]
        task_id: String,
        #[serde(default)]
        id: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        output: Option<Output>,
    }

    let parsed: SubmitResp = sonic_rs::from_slice(body).map_err(|e| {
        RelayError::upstream(
            500,
            "unmarshal_response_body_failed",
            format!("上游响应解析失败: {e}"),
        )
    })?;

    let output = parsed.output.unwrap_or_default();
    let task_id = [parsed.task_id, output.task_id, parsed.id]
        .into_iter()
        .find(|s| !s.is_empty());
    let Some(task_id) = task_id else {
        // 2xx 但没有任务 ID：多半是上游以 200 返回了错误体。
        let mut err = relay_error_from_response(status, body);
        if let RelayError::Upstream { status, .. } = &mut err
            && *status < 400
        {
            *status = 500;
        }
        return Err(err);
    };

    let status = if parsed.status.is_empty() {
        output.task_status
    } else {
        parsed.status
    };
    Ok(TaskResponse { task_id, status })
}
