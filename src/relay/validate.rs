use super::types::VideoRequest;
use crate::error::ValidationError;
use crate::util::model::{VideoModelKind, is_text_to_video_size};

/// 解析并校验请求体。纯函数，无副作用。
pub fn parse_and_validate(body: &[u8]) -> Result<VideoRequest, ValidationError> {
    let req: VideoRequest = sonic_rs::from_slice(body)
        .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
    validate(&req)?;
    Ok(req)
}

pub fn validate(req: &VideoRequest) -> Result<(), ValidationError> {
    if req.prompt.is_empty() {
        return Err(ValidationError::MissingField("prompt"));
    }

    match VideoModelKind::of(&req.model) {
        VideoModelKind::ImageToVideo => {
            if req.image_url.is_empty() {
                return Err(ValidationError::MissingField("image_url"));
            }
            // 0 表示未指定，放行给计费按默认 5 秒处理。
            if req.duration != 0 && !(3..=5).contains(&req.duration) {
                return Err(ValidationError::InvalidDuration(req.duration));
            }
        }
        VideoModelKind::TextToVideo => {
            if !is_text_to_video_size(&req.size) {
                return Err(ValidationError::InvalidSize(req.size.clone()));
            }
            if req.duration != 0 && req.duration != 5 {
                return Err(ValidationError::InvalidDuration(req.duration));
            }
        }
        VideoModelKind::Other => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i2v(duration: i64) -> VideoRequest {
        VideoRequest {
            model: "wanx2.1-i2v-turbo".to_string(),
            prompt: "a cat".to_string(),
            image_url: "https://example.com/cat.png".to_string(),
            duration,
            ..VideoRequest::default()
        }
    }

    fn t2v(size: &str, duration: i64) -> VideoRequest {
        VideoRequest {
            model: "wanx2.1-t2v-plus".to_string(),
            prompt: "dog running".to_string(),
            size: size.to_string(),
            duration,
            ..VideoRequest::default()
        }
    }

    #[test]
    fn empty_prompt_rejected_for_every_model() {
        for model in [
            "wanx2.1-i2v-turbo",
            "wanx2.1-i2v-plus",
            "wanx2.1-t2v-turbo",
            "wanx2.1-t2v-plus",
            "some-other-model",
        ] {
            let req = VideoRequest {
                model: model.to_string(),
                image_url: "https://example.com/cat.png".to_string(),
                ..VideoRequest::default()
            };
            assert_eq!(
                validate(&req),
                Err(ValidationError::MissingField("prompt")),
                "{model}"
            );
        }
    }

    #[test]
    fn image_to_video_requires_image_regardless_of_duration() {
        for d in [0, 3, 4, 5, 9] {
            let mut req = i2v(d);
            req.image_url.clear();
            assert_eq!(validate(&req), Err(ValidationError::MissingField("image_url")));
        }
    }

    #[test]
    fn image_to_video_duration_range() {
        for d in [0, 3, 4, 5] {
            assert_eq!(validate(&i2v(d)), Ok(()), "duration {d}");
        }
        for d in [1, 2, 6, 10, -1] {
            assert_eq!(validate(&i2v(d)), Err(ValidationError::InvalidDuration(d)));
        }
    }

    #[test]
    fn text_to_video_size_set() {
        assert_eq!(validate(&t2v("", 0)), Ok(()));
        assert_eq!(validate(&t2v("832 * 1088", 0)), Ok(()));
        assert_eq!(
            validate(&t2v("100x100", 0)),
            Err(ValidationError::InvalidSize("100x100".to_string()))
        );
    }

    #[test]
    fn text_to_video_duration_is_zero_or_five() {
        assert_eq!(validate(&t2v("", 5)), Ok(()));
        assert_eq!(validate(&t2v("", 4)), Err(ValidationError::InvalidDuration(4)));
    }

    #[test]
    fn other_models_only_need_prompt() {
        let req = VideoRequest {
            model: "kling-v1".to_string(),
            prompt: "x".to_string(),
            size: "100x100".to_string(),
            duration: 42,
            ..VideoRequest::default()
        };
        assert_eq!(validate(&req), Ok(()));
    }

    #[test]
    fn parses_img_url_alias_and_defaults() {
        let req = parse_and_validate(
            br#"{"model":"wanx2.1-i2v-plus","prompt":"a cat","img_url":"https://x/y.png"}"#,
        )
        .unwrap();
        assert_eq!(req.image_url, "https://x/y.png");
        assert_eq!(req.duration, 0);
        assert_eq!(req.size, "");
    }

    #[test]
    fn malformed_body_is_validation_error() {
        assert!(matches!(
            parse_and_validate(b"{\"model\":"),
            Err(ValidationError::MalformedBody(_))
        ));
    }
}
