//! 视频生成提交流程：校验 → 模型映射 → 报价 → 余额预检 → 上游提交 → 记录任务 → 扣费。

use super::context::{RelayContext, RelayInfo, reset_status_code};
use super::types::Usage;
use super::validate::parse_and_validate;
use crate::adaptor::{AdaptorRegistry, relay_error_from_response};
use crate::error::RelayError;
use crate::ledger::QuotaLedger;
use crate::pricing::{self, PricingHandle};
use crate::task::{Task, TaskRecorder};
use std::fmt;

/// 流水线阶段；出错时与错误类别一起写入日志。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStage {
    Validating,
    Pricing,
    CheckingQuota,
    ResolvingAdaptor,
    Converting,
    Dispatching,
    ParsingResponse,
    Recording,
    Consuming,
    Done,
}

impl fmt::Display for RelayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validating => "validating",
            Self::Pricing => "pricing",
            Self::CheckingQuota => "checking_quota",
            Self::ResolvingAdaptor => "resolving_adaptor",
            Self::Converting => "converting",
            Self::Dispatching => "dispatching",
            Self::ParsingResponse => "parsing_response",
            Self::Recording => "recording",
            Self::Consuming => "consuming",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub task_id: String,
    pub quota: i64,
    pub duration_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct VideoRelay {
    registry: AdaptorRegistry,
    pricing: PricingHandle,
    ledger: QuotaLedger,
    recorder: TaskRecorder,
}

impl VideoRelay {
    pub fn new(
        registry: AdaptorRegistry,
        pricing: PricingHandle,
        ledger: QuotaLedger,
        recorder: TaskRecorder,
    ) -> Self {
        Self {
            registry,
            pricing,
            ledger,
            recorder,
        }
    }

    /// 处理一次视频生成提交。成功时任务已记录且额度已扣除（扣费失败只记日志）。
    pub async fn relay(&self, ctx: &RelayContext, body: &[u8]) -> Result<SubmitOutcome, RelayError> {
        let mut stage = RelayStage::Validating;
        let result = self.run(ctx, body, &mut stage).await;
        if let Err(e) = &result {
            tracing::warn!(
                request_id = %ctx.request_id,
                user_id = ctx.user_id,
                stage = %stage,
                kind = e.kind(),
                "视频转发失败: {e:#}"
            );
        }
        result
    }

    async fn run(
        &self,
        ctx: &RelayContext,
        body: &[u8],
        stage: &mut RelayStage,
    ) -> Result<SubmitOutcome, RelayError> {
        *stage = RelayStage::Validating;
        let mut req = parse_and_validate(body)?;

        *stage = RelayStage::Pricing;
        let info = RelayInfo::new(ctx, &req.model)?;
        req.model = info.upstream_model.clone();

        let price_data = self.pricing.load().price(&info.origin_model, &info.group)?;
        let quote = pricing::quote(
            price_data,
            &info.upstream_model,
            req.duration,
            self.ledger.quota_per_unit(),
        );

        *stage = RelayStage::CheckingQuota;
        self.ledger.check_sufficient(info.user_id, quote.quota).await?;

        *stage = RelayStage::ResolvingAdaptor;
        let Some(mut adaptor) = self.registry.resolve(&info.channel.api_type) else {
            return Err(RelayError::config(
                "invalid_api_type",
                format!("无效的接口类型: {:?}", info.channel.api_type),
            ));
        };
        adaptor.init(&info);

        *stage = RelayStage::Converting;
        let converted = adaptor
            .convert_video_request(&info, &req)
            .map_err(|e| RelayError::Conversion(format!("{e:#}")))?;
        let payload =
            sonic_rs::to_vec(&converted).map_err(|e| RelayError::Conversion(e.to_string()))?;

        *stage = RelayStage::Dispatching;
        let resp = adaptor
            .do_request(&info, payload)
            .await
            .map_err(|e| RelayError::Transport(format!("{e:#}")))?;
        let is_stream = resp.is_event_stream();
        if resp.status != 200 {
            let mut err = relay_error_from_response(resp.status, &resp.body);
            reset_status_code(&mut err, &info.channel.status_code_mapping);
            return Err(err);
        }

        *stage = RelayStage::ParsingResponse;
        let task_resp = adaptor.do_response(&info, &resp).map_err(|mut e| {
            reset_status_code(&mut e, &info.channel.status_code_mapping);
            e
        })?;

        *stage = RelayStage::Recording;
        let task = Task::new(
            adaptor.platform(),
            &info,
            task_resp.task_id.clone(),
            quote.quota,
            is_stream,
        );
        self.recorder.insert(&task).await?;

        *stage = RelayStage::Consuming;
        let seconds = quote.duration_ratio as i64;
        let usage = Usage {
            prompt_tokens: seconds,
            completion_tokens: 0,
            total_tokens: seconds,
        };
        if let Err(e) = self
            .ledger
            .consume(
                &info,
                &usage,
                &quote.price_data,
                quote.quota,
                &format!("时长 {seconds}s"),
            )
            .await
        {
            // 任务已被上游受理，扣费失败不回滚。
            tracing::error!(
                request_id = %info.request_id,
                user_id = info.user_id,
                task_id = %task.task_id,
                quota = quote.quota,
                "扣费失败: {e:#}"
            );
        }

        *stage = RelayStage::Done;
        tracing::info!(
            request_id = %info.request_id,
            user_id = info.user_id,
            model = %info.origin_model,
            upstream_model = %info.upstream_model,
            task_id = %task.task_id,
            upstream_status = %task_resp.status,
            quota = quote.quota,
            "视频任务已提交"
        );

        Ok(SubmitOutcome {
            task_id: task.task_id,
            quota: quote.quota,
            duration_ratio: quote.duration_ratio,
        })
    }
}
