use serde::{Deserialize, Serialize};

/// 客户端提交的视频生成请求。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(alias = "img_url", default)]
    pub image_url: String,
    #[serde(default)]
    pub size: String,
    /// 秒；0 表示未指定，由上游取默认时长。
    #[serde(default)]
    pub duration: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt_extend: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// 提交成功后返回给客户端的确认。
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub task_id: String,
    pub quota: i64,
}
