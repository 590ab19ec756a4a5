use crate::config::Config;
use crate::error::RelayError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// 上游渠道设置。
#[derive(Debug, Clone, Default)]
pub struct ChannelSettings {
    pub api_type: String,
    pub base_url: String,
    pub api_key: String,
    pub platform: String,
    /// JSON：客户端模型名 -> 上游模型名。
    pub model_mapping: String,
    /// JSON：上游状态码 -> 返回给客户端的状态码，如 `{"400":"500"}`。
    pub status_code_mapping: String,
}

impl ChannelSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            api_type: cfg.upstream_api_type.clone(),
            base_url: cfg.upstream_base_url.clone(),
            api_key: cfg.upstream_api_key.clone(),
            platform: cfg.upstream_platform.clone(),
            model_mapping: cfg.model_mapping.clone(),
            status_code_mapping: cfg.status_code_mapping.clone(),
        }
    }
}

/// 调用方（路由/鉴权层）为每个请求提供的上下文。
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub user_id: i64,
    pub group: String,
    pub channel: ChannelSettings,
    pub start_time: DateTime<Utc>,
}

/// 完成模型映射后的只读转发信息，传给每个组件。
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub user_id: i64,
    pub group: String,
    pub channel: ChannelSettings,
    pub start_time: DateTime<Utc>,
    pub origin_model: String,
    pub upstream_model: String,
}

impl RelayInfo {
    pub fn new(ctx: &RelayContext, origin_model: &str) -> Result<Self, RelayError> {
        let upstream_model = map_model(&ctx.channel.model_mapping, origin_model)?;
        Ok(Self {
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id,
            group: ctx.group.clone(),
            channel: ctx.channel.clone(),
            start_time: ctx.start_time,
            origin_model: origin_model.to_string(),
            upstream_model,
        })
    }
}

fn map_model(mapping: &str, model: &str) -> Result<String, RelayError> {
    let mapping = mapping.trim();
    if mapping.is_empty() || mapping == "{}" {
        return Ok(model.to_string());
    }
    let m: HashMap<String, String> = sonic_rs::from_str(mapping)
        .map_err(|e| RelayError::config("model_mapped_error", format!("模型映射解析失败: {e}")))?;
    match m.get(model) {
        Some(mapped) if !mapped.is_empty() => Ok(mapped.clone()),
        _ => Ok(model.to_string()),
    }
}

/// 按渠道的状态码映射重写上游错误的状态码；映射为空或无法解析时保持不变。
pub fn reset_status_code(err: &mut RelayError, mapping: &str) {
    let mapping = mapping.trim();
    if mapping.is_empty() || mapping == "{}" {
        return;
    }
    let Ok(m) = sonic_rs::from_str::<HashMap<String, String>>(mapping) else {
        return;
    };
    let RelayError::Upstream { status, .. } = err else {
        return;
    };
    if *status == 200 {
        return;
    }
    if let Some(new_status) = m
        .get(&status.to_string())
        .and_then(|s| s.trim().parse::<u16>().ok())
    {
        *status = new_status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(mapping: &str) -> RelayContext {
        RelayContext {
            request_id: "vreq-1".to_string(),
            user_id: 7,
            group: "default".to_string(),
            channel: ChannelSettings {
                model_mapping: mapping.to_string(),
                ..ChannelSettings::default()
            },
            start_time: Utc::now(),
        }
    }

    #[test]
    fn model_mapping_applies_when_present() {
        let info = RelayInfo::new(
            &ctx(r#"{"video-fast":"wanx2.1-t2v-turbo"}"#),
            "video-fast",
        )
        .unwrap();
        assert_eq!(info.origin_model, "video-fast");
        assert_eq!(info.upstream_model, "wanx2.1-t2v-turbo");

        let info = RelayInfo::new(&ctx(r#"{"video-fast":""}"#), "video-fast").unwrap();
        assert_eq!(info.upstream_model, "video-fast");

        let info = RelayInfo::new(&ctx(""), "wanx2.1-i2v-plus").unwrap();
        assert_eq!(info.upstream_model, "wanx2.1-i2v-plus");
    }

    #[test]
    fn invalid_model_mapping_is_config_error() {
        let err = RelayInfo::new(&ctx("{oops"), "m").unwrap_err();
        assert_eq!(err.code(), "model_mapped_error");
        assert_eq!(err.status().as_u16(), 500);
    }

    #[test]
    fn status_code_mapping_rewrites_upstream_errors_only() {
        let mut err = RelayError::upstream(400, "", "bad");
        reset_status_code(&mut err, r#"{"400":"502"}"#);
        assert_eq!(err.status().as_u16(), 502);

        let mut err = RelayError::upstream(429, "", "slow");
        reset_status_code(&mut err, r#"{"400":"502"}"#);
        assert_eq!(err.status().as_u16(), 429);

        let mut err = RelayError::upstream(400, "", "bad");
        reset_status_code(&mut err, "not json");
        assert_eq!(err.status().as_u16(), 400);

        let mut err = RelayError::Transport("x".to_string());
        reset_status_code(&mut err, r#"{"500":"502"}"#);
        assert_eq!(err.status().as_u16(), 500);
    }
}
