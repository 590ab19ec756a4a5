//! 异步任务记录：把上游任务 ID 与为其预留的额度持久化关联起来。

pub mod store;

use crate::error::RelayError;
use crate::relay::context::RelayInfo;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 插入失败后的最大尝试次数。
pub const INSERT_MAX_ATTEMPTS: usize = 5;
/// 相邻两次尝试之间的固定间隔（不退避、不抖动）。
pub const INSERT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPlatform {
    Ali,
    Kling,
}

impl TaskPlatform {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "ali" | "dashscope" => Some(Self::Ali),
            "kling" => Some(Self::Kling),
            _ => None,
        }
    }
}

/// 任务状态；创建时为 NOT_START，后续由任务轮询方更新。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotStart,
    Submitted,
    Queued,
    InProgress,
    Failure,
    Success,
    Unknown,
}

/// 创建任务时的请求上下文快照。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRelayInfo {
    pub request_id: String,
    pub origin_model: String,
    pub upstream_model: String,
    pub api_type: String,
    #[serde(default)]
    pub is_stream: bool,
    pub consume_quota: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub platform: TaskPlatform,
    pub user_id: i64,
    pub group: String,
    pub action: String,
    pub status: TaskStatus,
    /// unix 秒
    pub submit_time: i64,
    pub quota: i64,
    pub properties: TaskRelayInfo,
}

impl Task {
    pub fn new(
        platform: TaskPlatform,
        info: &RelayInfo,
        task_id: String,
        quota: i64,
        is_stream: bool,
    ) -> Self {
        Self {
            task_id,
            platform,
            user_id: info.user_id,
            group: info.group.clone(),
            action: "generate".to_string(),
            status: TaskStatus::NotStart,
            submit_time: Utc::now().timestamp(),
            quota,
            properties: TaskRelayInfo {
                request_id: info.request_id.clone(),
                origin_model: info.origin_model.clone(),
                upstream_model: info.upstream_model.clone(),
                api_type: info.channel.api_type.clone(),
                is_stream,
                consume_quota: true,
            },
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> anyhow::Result<()>;

    async fn get(&self, task_id: &str) -> anyhow::Result<Option<Task>>;
}

/// 带有限重试的任务写入。
#[derive(Clone)]
pub struct TaskRecorder {
    store: Arc<dyn TaskStore>,
}

impl TaskRecorder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// 最多尝试 [`INSERT_MAX_ATTEMPTS`] 次，每次失败后等待 [`INSERT_RETRY_DELAY`]
    /// （最后一次失败后不再等待）。全部失败返回 [`RelayError::Persistence`]。
    pub async fn insert(&self, task: &Task) -> Result<(), RelayError> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=INSERT_MAX_ATTEMPTS {
            match self.store.insert(task).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(task_id = %task.task_id, attempt, "任务写入重试成功");
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.task_id, attempt, error = ?e, "任务写入失败");
                    last_err = Some(e);
                    if attempt < INSERT_MAX_ATTEMPTS {
                        tokio::time::sleep(INSERT_RETRY_DELAY).await;
                    }
                }
            }
        }

        let msg = last_err
            .map(|e| format!("{e:#}"))
            .unwrap_or_else(|| "未知错误".to_string());
        Err(RelayError::Persistence(format!(
            "任务 {} 写入 {INSERT_MAX_ATTEMPTS} 次均失败: {msg}",
            task.task_id
        )))
    }
}

impl std::fmt::Debug for TaskRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecorder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryTaskStore, relay_info};
    use std::time::Instant;

    fn task() -> Task {
        Task::new(TaskPlatform::Ali, &relay_info(), "t-1".to_string(), 80_000, false)
    }

    #[test]
    fn new_task_snapshot() {
        let t = task();
        assert_eq!(t.status, TaskStatus::NotStart);
        assert_eq!(t.user_id, 1);
        assert_eq!(t.quota, 80_000);
        assert!(t.properties.consume_quota);
        assert_eq!(t.properties.request_id, "vreq-test");
    }

    #[test]
    fn task_serializes_with_stable_names() {
        let v = serde_json::to_value(task()).unwrap();
        assert_eq!(v["platform"], "ali");
        assert_eq!(v["status"], "NOT_START");
    }

    #[tokio::test]
    async fn insert_succeeds_after_transient_failures() {
        let store = Arc::new(MemoryTaskStore::failing_first(2));
        let recorder = TaskRecorder::new(store.clone());

        recorder.insert(&task()).await.unwrap();
        assert_eq!(store.attempts(), 3);
        assert!(store.get("t-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn insert_gives_up_after_five_attempts() {
        let store = Arc::new(MemoryTaskStore::failing_first(usize::MAX));
        let recorder = TaskRecorder::new(store.clone());

        let start = Instant::now();
        let err = recorder.insert(&task()).await.unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(store.attempts(), 5);
        assert_eq!(err.kind(), "persistence_error");
        // 5 次尝试之间共 4 次固定等待。
        assert!(elapsed >= INSERT_RETRY_DELAY * 4);
    }
}
