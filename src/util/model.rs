//! 视频模型族识别。
//!
//! 校验规则与时长计费都按模型族区分：图生视频支持 3/4/5 秒，文生视频仅支持 5 秒。

pub const WANX_I2V_TURBO: &str = "wanx2.1-i2v-turbo";
pub const WANX_I2V_PLUS: &str = "wanx2.1-i2v-plus";
pub const WANX_T2V_TURBO: &str = "wanx2.1-t2v-turbo";
pub const WANX_T2V_PLUS: &str = "wanx2.1-t2v-plus";

/// 文生视频允许的分辨率（空字符串表示由上游取默认值）。
pub const TEXT_TO_VIDEO_SIZES: [&str; 5] = [
    "1280 * 720",
    "960 * 960",
    "720 * 1280",
    "1088 * 832",
    "832 * 1088",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoModelKind {
    ImageToVideo,
    TextToVideo,
    Other,
}

impl VideoModelKind {
    pub fn of(model: &str) -> Self {
        match model {
            WANX_I2V_TURBO | WANX_I2V_PLUS => Self::ImageToVideo,
            WANX_T2V_TURBO | WANX_T2V_PLUS => Self::TextToVideo,
            _ => Self::Other,
        }
    }
}

pub fn is_text_to_video_size(size: &str) -> bool {
    size.is_empty() || TEXT_TO_VIDEO_SIZES.contains(&size)
}
