//! 账户额度：请求前的余额预检与任务记录后的扣费。
//!
//! 预检与扣费不在同一事务内，同一账户的并发请求可能同时通过预检。

pub mod store;

use crate::error::RelayError;
use crate::pricing::{PriceData, format_quota};
use crate::relay::context::RelayInfo;
use crate::relay::types::Usage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 额度账户。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub key: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_enable() -> bool {
    true
}

/// 一条消费日志。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLog {
    pub user_id: i64,
    pub request_id: String,
    pub model: String,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub use_price: bool,
    pub model_price: f64,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_user_quota(&self, user_id: i64) -> anyhow::Result<i64>;

    async fn find_by_key(&self, key: &str) -> anyhow::Result<Option<Account>>;

    /// 扣减余额、累加已用额度与请求次数，并写入消费日志。
    async fn post_consume(&self, log: &ConsumeLog) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    quota_per_unit: f64,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, quota_per_unit: f64) -> Self {
        Self {
            store,
            quota_per_unit,
        }
    }

    /// 余额预检：`余额 - 需要额度 < 0` 时拒绝，恰好相等允许。返回当前余额。
    pub async fn check_sufficient(&self, user_id: i64, quota: i64) -> Result<i64, RelayError> {
        let balance = self.store.get_user_quota(user_id).await?;
        if balance - quota < 0 {
            return Err(RelayError::InsufficientQuota {
                balance: format_quota(balance, self.quota_per_unit),
                need: format_quota(quota, self.quota_per_unit),
            });
        }
        Ok(balance)
    }

    pub fn quota_per_unit(&self) -> f64 {
        self.quota_per_unit
    }

    /// 任务记录成功后扣除报价时的额度；`price_data` 只用于消费日志。
    pub async fn consume(
        &self,
        info: &RelayInfo,
        usage: &Usage,
        price_data: &PriceData,
        quota: i64,
        log_content: &str,
    ) -> anyhow::Result<()> {
        let content = format!(
            "模型价格 {:.2}，分组倍率 {:.2}，{log_content}",
            price_data.model_price, price_data.group_ratio
        );
        let log = ConsumeLog {
            user_id: info.user_id,
            request_id: info.request_id.clone(),
            model: info.origin_model.clone(),
            quota,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            use_price: price_data.use_price,
            model_price: price_data.model_price,
            model_ratio: price_data.model_ratio,
            group_ratio: price_data.group_ratio,
            content,
            created_at: Utc::now(),
        };
        self.store.post_consume(&log).await
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("quota_per_unit", &self.quota_per_unit)
            .finish_non_exhaustive()
    }
}
