use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::Duration;

/// 请求/响应详细日志等级（`DEBUG`）：
/// - off：不输出
/// - low：客户端请求/响应，格式化并脱敏
/// - medium：另加上游请求/响应
/// - high：全部原样输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Upstream,
}

impl Side {
    fn label(self) -> &'static str {
        match self {
            Self::Client => "客户端",
            Self::Upstream => "上游",
        }
    }

    fn enabled(self, level: LogLevel) -> bool {
        match self {
            Self::Client => level.client_enabled(),
            Self::Upstream => level.backend_enabled(),
        }
    }

    /// 需要打码的请求头（小写）。
    fn redacted_headers(self) -> &'static [&'static str] {
        match self {
            Self::Client => &["authorization", "proxy-authorization", "x-api-key", "cookie"],
            Self::Upstream => &["authorization", "proxy-authorization"],
        }
    }
}

pub fn client_request(level: LogLevel, method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    log_request(Side::Client, level, method, path, headers, body);
}

pub fn client_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    log_response(Side::Client, level, status, duration, body);
}

pub fn backend_request(level: LogLevel, method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    log_request(Side::Upstream, level, method, url, headers, body);
}

pub fn backend_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    log_response(Side::Upstream, level, status, duration, body);
}

fn log_request(
    side: Side,
    level: LogLevel,
    method: &str,
    target: &str,
    headers: &HeaderMap,
    body: &[u8],
) {
    if !side.enabled(level) {
        return;
    }
    let label = side.label();
    let (headers, body) = if level.raw_enabled() {
        (format_headers_raw(headers), format_bytes_raw(body))
    } else {
        (
            format_headers(headers, side.redacted_headers()),
            format_body_bytes(body),
        )
    };
    tracing::info!(
        "\n{}\n[{label}请求] {method} {target}\n[{label}请求头]\n{headers}\n[{label}请求体]\n{body}\n{RULE}",
        banner(label, "请求", level),
    );
}

fn log_response(side: Side, level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    if !side.enabled(level) {
        return;
    }
    let label = side.label();
    let body = if level.raw_enabled() {
        format_bytes_raw(body)
    } else {
        format_body_bytes(body)
    };
    tracing::info!(
        "\n{}\n[{label}响应] {status} {}ms\n{body}\n{RULE}",
        banner(label, "响应", level),
        duration_ms(duration),
    );
}

const RULE: &str = "========================================================";

fn banner(label: &str, kind: &str, level: LogLevel) -> String {
    let raw = if level.raw_enabled() { "（RAW）" } else { "" };
    format!("==================== {label}{kind}{raw} ====================")
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

fn format_headers(headers: &HeaderMap, redacted: &[&str]) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let v = if redacted.contains(&key) {
            sonic_rs::Value::from("***")
        } else {
            sonic_rs::Value::from(value.to_str().unwrap_or("<binary>"))
        };

        // 同名多值合并为数组。
        let mut values = obj
            .get(&key)
            .and_then(|v| v.as_array())
            .map(|a| a.to_vec())
            .unwrap_or_default();
        values.push(v);
        obj.insert(key, values);
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v);
    sonic_rs::to_string_pretty(&sanitized).unwrap_or_else(|_| sanitized.to_string())
}

fn format_body_bytes(bytes: &[u8]) -> String {
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.is_empty() {
        return String::new();
    }
    if bytes.len() > MAX_PARSE_BYTES {
        let head = String::from_utf8_lossy(&bytes[..HEAD_TAIL]);
        let tail = String::from_utf8_lossy(&bytes[bytes.len() - HEAD_TAIL..]);
        return format!(
            "(body too large: {} bytes)\n--- head ---\n{head}\n--- tail ---\n{tail}",
            bytes.len(),
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn format_headers_raw(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{}: {}\n", k, v.to_str().unwrap_or("<non-utf8>")))
        .collect()
}

fn format_bytes_raw(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    match s.char_indices().nth(MAX_CHARS) {
        Some((idx, _)) => format!("{}...[TRUNCATED]", &s[..idx]),
        None => s.to_string(),
    }
}

/// 递归遍历 JSON，截断参考图字段中的 base64 data URL。
fn sanitize_json_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match (key, child.as_str()) {
                ("image_url" | "img_url", Some(s)) => sonic_rs::Value::from(truncate_data_url(s).as_ref()),
                _ => sanitize_json_for_log(child),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr.iter().map(sanitize_json_for_log).collect();
        return sonic_rs::Value::from(out);
    }

    v.to_owned()
}

fn truncate_data_url(s: &str) -> Cow<'_, str> {
    const KEEP: usize = 20;
    const MARKER: &str = ";base64,";

    let Some(idx) = s.find(MARKER) else {
        return Cow::Borrowed(s);
    };
    let (prefix, payload) = s.split_at(idx + MARKER.len());
    if payload.len() <= 100 {
        return Cow::Borrowed(s);
    }

    let omitted = payload.len() - KEEP * 2;
    Cow::Owned(format!(
        "{prefix}{}...[TRUNCATED: {omitted} chars]...{}",
        &payload[..KEEP],
        &payload[payload.len() - KEEP..]
    ))
}
