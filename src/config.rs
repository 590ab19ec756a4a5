use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8046;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_API_TYPE: &str = "passthrough";
const DEFAULT_PLATFORM: &str = "ali";
const DEFAULT_PRICING_RELOAD_SECS: u64 = 30;

/// 1 美元对应的额度点数。
pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub timeout_ms: u64,
    pub proxy: String,

    pub debug: String,
    pub data_dir: String,

    pub quota_per_unit: f64,

    pub upstream_api_type: String,
    pub upstream_base_url: String,
    pub upstream_api_key: String,
    pub upstream_platform: String,

    /// 原样保留 JSON 字符串，按请求解析（解析失败要作为该请求的配置错误返回）。
    pub model_mapping: String,
    pub status_code_mapping: String,

    pub model_price: HashMap<String, f64>,
    pub model_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,

    pub pricing_reload_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,

    #[serde(alias = "QUOTA_PER_UNIT")]
    quota_per_unit: Option<f64>,

    #[serde(alias = "UPSTREAM_API_TYPE")]
    upstream_api_type: Option<String>,
    #[serde(alias = "UPSTREAM_BASE_URL")]
    upstream_base_url: Option<String>,
    #[serde(alias = "UPSTREAM_API_KEY")]
    upstream_api_key: Option<String>,
    #[serde(alias = "UPSTREAM_PLATFORM")]
    upstream_platform: Option<String>,

    #[serde(alias = "MODEL_MAPPING")]
    model_mapping: Option<String>,
    #[serde(alias = "STATUS_CODE_MAPPING")]
    status_code_mapping: Option<String>,

    #[serde(alias = "MODEL_PRICE")]
    model_price: Option<String>,
    #[serde(alias = "MODEL_RATIO")]
    model_ratio: Option<String>,
    #[serde(alias = "GROUP_RATIO")]
    group_ratio: Option<String>,

    #[serde(alias = "PRICING_RELOAD_SECS")]
    pricing_reload_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut group_ratio = parse_ratio_map("GROUP_RATIO", raw.group_ratio.as_deref());
        group_ratio.entry("default".to_string()).or_insert(1.0);

        let mut cfg = Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            data_dir: raw.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            quota_per_unit: raw
                .quota_per_unit
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(DEFAULT_QUOTA_PER_UNIT),
            upstream_api_type: raw
                .upstream_api_type
                .unwrap_or_else(|| DEFAULT_API_TYPE.to_string()),
            upstream_base_url: raw.upstream_base_url.unwrap_or_default(),
            upstream_api_key: raw.upstream_api_key.unwrap_or_default(),
            upstream_platform: raw
                .upstream_platform
                .unwrap_or_else(|| DEFAULT_PLATFORM.to_string()),
            model_mapping: raw.model_mapping.unwrap_or_default(),
            status_code_mapping: raw.status_code_mapping.unwrap_or_default(),
            model_price: parse_ratio_map("MODEL_PRICE", raw.model_price.as_deref()),
            model_ratio: parse_ratio_map("MODEL_RATIO", raw.model_ratio.as_deref()),
            group_ratio,
            pricing_reload_secs: raw
                .pricing_reload_secs
                .unwrap_or(DEFAULT_PRICING_RELOAD_SECS),
        };

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn pricing_file(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("pricing.json")
    }
}

/// 解析形如 `{"wanx2.1-i2v-turbo": 16}` 的倍率表；格式错误时记录告警并返回空表。
fn parse_ratio_map(key: &str, value: Option<&str>) -> HashMap<String, f64> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return HashMap::new();
    };
    match sonic_rs::from_str::<HashMap<String, f64>>(value) {
        Ok(m) => m
            .into_iter()
            .filter(|(_, v)| v.is_finite() && *v >= 0.0)
            .collect(),
        Err(e) => {
            tracing::warn!("{key} 不是合法的 JSON 对象，已忽略: {e}");
            HashMap::new()
        }
    }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已显式设置的环境变量优先于 .env。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：set_var 为 unsafe；这里在启动阶段、未启动任何线程前调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
