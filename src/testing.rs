//! 测试替身：脚本化的上游适配器与内存存储。

use crate::adaptor::{Adaptor, TaskResponse, UpstreamResponse, relay_error_from_response};
use crate::error::RelayError;
use crate::ledger::{Account, ConsumeLog, QuotaStore};
use crate::relay::context::{ChannelSettings, RelayInfo};
use crate::relay::types::VideoRequest;
use crate::task::{Task, TaskPlatform, TaskStore};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use axum::http::header::CONTENT_TYPE;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn relay_info() -> RelayInfo {
    RelayInfo {
        request_id: "vreq-test".to_string(),
        user_id: 1,
        group: "default".to_string(),
        channel: ChannelSettings {
            api_type: "passthrough".to_string(),
            platform: "ali".to_string(),
            ..ChannelSettings::default()
        },
        start_time: Utc::now(),
        origin_model: "wanx2.1-i2v-turbo".to_string(),
        upstream_model: "wanx2.1-i2v-turbo".to_string(),
    }
}

#[derive(Debug, Clone)]
enum Script {
    Accept { task_id: String, event_stream: bool },
    ConversionFailure,
    TransportFailure,
    Respond { status: u16, body: Vec<u8> },
}

/// 按脚本返回结果的适配器。克隆体共享调用计数与最近一次请求体。
#[derive(Debug, Clone)]
pub struct MockAdaptor {
    script: Script,
    calls: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<serde_json::Value>>>,
}

impl MockAdaptor {
    fn scripted(script: Script) -> Self {
        Self {
            script,
            calls: Arc::new(AtomicUsize::new(0)),
            last_body: Arc::new(Mutex::new(None)),
        }
    }

    pub fn accepting(task_id: &str) -> Self {
        Self::scripted(Script::Accept {
            task_id: task_id.to_string(),
            event_stream: false,
        })
    }

    pub fn streaming(task_id: &str) -> Self {
        Self::scripted(Script::Accept {
            task_id: task_id.to_string(),
            event_stream: true,
        })
    }

    pub fn failing_conversion() -> Self {
        Self::scripted(Script::ConversionFailure)
    }

    pub fn unreachable() -> Self {
        Self::scripted(Script::TransportFailure)
    }

    pub fn responding(status: u16, body: &str) -> Self {
        Self::scripted(Script::Respond {
            status,
            body: body.as_bytes().to_vec(),
        })
    }

    /// 发往上游的请求次数。
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Option<serde_json::Value> {
        self.last_body.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adaptor for MockAdaptor {
    fn init(&mut self, _info: &RelayInfo) {}

    fn convert_video_request(
        &self,
        info: &RelayInfo,
        req: &VideoRequest,
    ) -> anyhow::Result<serde_json::Value> {
        if matches!(self.script, Script::ConversionFailure) {
            return Err(anyhow!("unsupported field"));
        }
        let mut out = req.clone();
        out.model = info.upstream_model.clone();
        serde_json::to_value(out).context("序列化视频请求失败")
    }

    async fn do_request(&self, _info: &RelayInfo, body: Vec<u8>) -> anyhow::Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_body.lock().unwrap() = serde_json::from_slice(&body).ok();

        let mut headers = HeaderMap::new();
        let (status, body) = match &self.script {
            Script::Accept {
                task_id,
                event_stream,
            } => {
                let ct = if *event_stream {
                    "text/event-stream"
                } else {
                    "application/json"
                };
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
                (200, format!(r#"{{"task_id":"{task_id}"}}"#).into_bytes())
            }
            Script::Respond { status, body } => (*status, body.clone()),
            Script::TransportFailure => return Err(anyhow!("connection refused")),
            Script::ConversionFailure => return Err(anyhow!("unexpected dispatch")),
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    fn do_response(
        &self,
        _info: &RelayInfo,
        resp: &UpstreamResponse,
    ) -> Result<TaskResponse, RelayError> {
        match &self.script {
            Script::Accept { task_id, .. } => Ok(TaskResponse {
                task_id: task_id.clone(),
                status: "submitted".to_string(),
            }),
            _ => Err(relay_error_from_response(resp.status, &resp.body)),
        }
    }

    fn platform(&self) -> TaskPlatform {
        TaskPlatform::Ali
    }
}

/// 内存任务存储；前 `n` 次写入失败。
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    fail_first: usize,
    attempts: AtomicUsize,
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &Task) -> anyhow::Result<()> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(anyhow!("database is locked"));
        }
        self.tasks
            .lock()
            .unwrap()
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(task_id).cloned())
    }
}

/// 内存账户存储。
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    accounts: Mutex<Vec<Account>>,
    logs: Mutex<Vec<ConsumeLog>>,
    fail_consume: bool,
}

impl MemoryQuotaStore {
    pub fn with_balance(user_id: i64, quota: i64) -> Self {
        Self::with_accounts(vec![Account {
            id: user_id,
            key: format!("sk-user-{user_id}"),
            group: "default".to_string(),
            quota,
            used_quota: 0,
            request_count: 0,
            enable: true,
        }])
    }

    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            ..Self::default()
        }
    }

    /// 扣费总是失败。
    pub fn failing_consume(mut self) -> Self {
        self.fail_consume = true;
        self
    }

    pub fn logs(&self) -> Vec<ConsumeLog> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn get_user_quota(&self, user_id: i64) -> anyhow::Result<i64> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == user_id)
            .map(|a| a.quota)
            .ok_or_else(|| anyhow!("账户 {user_id} 不存在"))
    }

    async fn find_by_key(&self, key: &str) -> anyhow::Result<Option<Account>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.key == key)
            .cloned())
    }

    async fn post_consume(&self, log: &ConsumeLog) -> anyhow::Result<()> {
        if self.fail_consume {
            return Err(anyhow!("disk full"));
        }
        {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts
                .iter_mut()
                .find(|a| a.id == log.user_id)
                .ok_or_else(|| anyhow!("账户 {} 不存在", log.user_id))?;
            account.quota -= log.quota;
            account.used_quota += log.quota;
            account.request_count += 1;
        }
        self.logs.lock().unwrap().push(log.clone());
        Ok(())
    }
}
