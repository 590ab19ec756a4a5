//! 计费：模型价格/倍率查询、时长倍率、额度计算。
//!
//! 价格表是运行时可替换的快照（ArcSwap），读路径无锁。

mod reload;

pub use reload::spawn_reload_task;

use crate::config::Config;
use crate::error::RelayError;
use crate::util::model::VideoModelKind;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// 每 1 点模型倍率对应的美元单价：倍率 16 = $0.04。
pub const USD_PER_MODEL_RATIO: f64 = 0.0025;

/// 未识别的时长一律按 5 秒计费。
pub const DEFAULT_DURATION_RATIO: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceData {
    pub use_price: bool,
    pub model_price: f64,
    pub model_ratio: f64,
    pub group_ratio: f64,
}

impl PriceData {
    /// 额度 = 价格 × 分组倍率 × 每单位额度，向零截断。
    pub fn quota(&self, quota_per_unit: f64) -> i64 {
        (self.model_price * self.group_ratio * quota_per_unit) as i64
    }
}

/// 一次视频请求的报价结果。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    /// 已按时长放大过的价格数据。
    pub price_data: PriceData,
    pub duration_ratio: f64,
    pub quota: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    pub model_price: HashMap<String, f64>,
    #[serde(default)]
    pub model_ratio: HashMap<String, f64>,
    #[serde(default)]
    pub group_ratio: HashMap<String, f64>,
}

impl PricingTable {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model_price: cfg.model_price.clone(),
            model_ratio: cfg.model_ratio.clone(),
            group_ratio: cfg.group_ratio.clone(),
        }
    }

    /// 以 `other` 中出现的条目覆盖当前表。
    pub fn merged(&self, other: &PricingTable) -> PricingTable {
        let mut out = self.clone();
        out.model_price
            .extend(other.model_price.iter().map(|(k, v)| (k.clone(), *v)));
        out.model_ratio
            .extend(other.model_ratio.iter().map(|(k, v)| (k.clone(), *v)));
        out.group_ratio
            .extend(other.group_ratio.iter().map(|(k, v)| (k.clone(), *v)));
        out
    }

    /// 查询模型价格。配置了固定价格时直接使用，否则由模型倍率折算。
    pub fn price(&self, model: &str, group: &str) -> Result<PriceData, RelayError> {
        let group_ratio = self.group_ratio(group);

        if let Some(price) = self.model_price.get(model) {
            return Ok(PriceData {
                use_price: true,
                model_price: *price,
                model_ratio: 0.0,
                group_ratio,
            });
        }

        let Some(ratio) = self.model_ratio.get(model) else {
            return Err(RelayError::config(
                "model_price_error",
                format!("模型 {model} 倍率或价格未配置"),
            ));
        };

        Ok(PriceData {
            use_price: false,
            model_price: USD_PER_MODEL_RATIO * ratio,
            model_ratio: *ratio,
            group_ratio,
        })
    }

    fn group_ratio(&self, group: &str) -> f64 {
        match self.group_ratio.get(group) {
            Some(r) => *r,
            None => {
                tracing::warn!(group, "分组倍率未配置，按 1 计算");
                1.0
            }
        }
    }
}

/// 时长倍率：文生视频固定 5 秒；图生视频 3/4/5 秒按实际时长，其余按 5 秒。
pub fn duration_ratio(model: &str, duration: i64) -> f64 {
    match VideoModelKind::of(model) {
        VideoModelKind::ImageToVideo => match duration {
            3 => 3.0,
            4 => 4.0,
            _ => DEFAULT_DURATION_RATIO,
        },
        VideoModelKind::TextToVideo | VideoModelKind::Other => DEFAULT_DURATION_RATIO,
    }
}

/// 按时长放大价格并计算额度。`model` 为上游模型名。
pub fn quote(mut price_data: PriceData, model: &str, duration: i64, quota_per_unit: f64) -> Quote {
    let duration_ratio = duration_ratio(model, duration);
    price_data.model_price *= duration_ratio;
    Quote {
        price_data,
        duration_ratio,
        quota: price_data.quota(quota_per_unit),
    }
}

pub fn format_quota(quota: i64, quota_per_unit: f64) -> String {
    format!("${:.6}", quota as f64 / quota_per_unit)
}

/// 运行时价格表句柄。
#[derive(Debug, Clone)]
pub struct PricingHandle {
    inner: Arc<ArcSwap<PricingTable>>,
}

impl PricingHandle {
    pub fn new(table: PricingTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    pub fn load(&self) -> Arc<PricingTable> {
        self.inner.load_full()
    }

    pub fn store(&self, table: PricingTable) {
        self.inner.store(Arc::new(table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QPU: f64 = 500_000.0;

    fn table() -> PricingTable {
        PricingTable {
            model_price: HashMap::from([("flat".to_string(), 1.0)]),
            model_ratio: HashMap::from([
                ("wanx2.1-i2v-turbo".to_string(), 16.0),
                ("wanx2.1-t2v-plus".to_string(), 16.0),
            ]),
            group_ratio: HashMap::from([
                ("default".to_string(), 1.0),
                ("vip".to_string(), 0.7),
            ]),
        }
    }

    #[test]
    fn image_to_video_duration_ratio_matches_duration() {
        for model in ["wanx2.1-i2v-turbo", "wanx2.1-i2v-plus"] {
            assert_eq!(duration_ratio(model, 3), 3.0);
            assert_eq!(duration_ratio(model, 4), 4.0);
            assert_eq!(duration_ratio(model, 5), 5.0);
            for d in [0, 1, 2, 6, 10, -3] {
                assert_eq!(duration_ratio(model, d), 5.0, "duration {d}");
            }
        }
    }

    #[test]
    fn text_to_video_duration_ratio_is_always_five() {
        for model in ["wanx2.1-t2v-turbo", "wanx2.1-t2v-plus"] {
            for d in [0, 3, 4, 5, 10] {
                assert_eq!(duration_ratio(model, d), 5.0);
            }
        }
    }

    #[test]
    fn ratio_is_converted_to_price() {
        let p = table().price("wanx2.1-i2v-turbo", "default").unwrap();
        assert!(!p.use_price);
        assert_eq!(p.model_ratio, 16.0);
        assert_eq!(p.model_price, 0.04);
        assert_eq!(p.group_ratio, 1.0);
    }

    #[test]
    fn explicit_price_wins_over_ratio() {
        let mut t = table();
        t.model_price.insert("wanx2.1-i2v-turbo".to_string(), 0.5);
        let p = t.price("wanx2.1-i2v-turbo", "vip").unwrap();
        assert!(p.use_price);
        assert_eq!(p.model_price, 0.5);
        assert_eq!(p.group_ratio, 0.7);
    }

    #[test]
    fn missing_model_is_config_error() {
        let err = table().price("unknown-model", "default").unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert_eq!(err.code(), "model_price_error");
    }

    #[test]
    fn unknown_group_falls_back_to_one() {
        let p = table().price("flat", "nobody").unwrap();
        assert_eq!(p.group_ratio, 1.0);
    }

    #[test]
    fn flat_price_scaled_by_duration() {
        let p = table().price("flat", "default").unwrap();
        let q = quote(p, "wanx2.1-i2v-turbo", 3, QPU);
        assert_eq!(q.duration_ratio, 3.0);
        assert_eq!(q.price_data.model_price, 3.0);
        assert_eq!(q.quota, 3 * 500_000);
    }

    #[test]
    fn ratio_price_quota_per_duration() {
        let p = table().price("wanx2.1-i2v-turbo", "default").unwrap();
        assert_eq!(quote(p, "wanx2.1-i2v-turbo", 3, QPU).quota, 60_000);
        assert_eq!(quote(p, "wanx2.1-i2v-turbo", 4, QPU).quota, 80_000);
        assert_eq!(quote(p, "wanx2.1-i2v-turbo", 0, QPU).quota, 100_000);

        let p = table().price("wanx2.1-t2v-plus", "vip").unwrap();
        assert_eq!(quote(p, "wanx2.1-t2v-plus", 3, QPU).quota, 70_000);
    }

    #[test]
    fn quota_truncates_fractional_units() {
        let base = PriceData {
            use_price: true,
            model_price: 0.0000011,
            model_ratio: 0.0,
            group_ratio: 1.0,
        };
        // 1.65 -> 1, 2.75 -> 2
        assert_eq!(quote(base, "wanx2.1-i2v-plus", 3, QPU).quota, 1);
        assert_eq!(quote(base, "wanx2.1-i2v-plus", 5, QPU).quota, 2);

        // 0.7 * 3 在浮点下略小于 2.1，截断后少 1 点。
        let p = PriceData {
            model_price: 0.7,
            ..base
        };
        assert_eq!(quote(p, "wanx2.1-i2v-plus", 3, QPU).quota, 1_049_999);
    }

    #[test]
    fn merged_overrides_entries() {
        let base = table();
        let overlay = PricingTable {
            model_ratio: HashMap::from([("wanx2.1-i2v-turbo".to_string(), 8.0)]),
            ..PricingTable::default()
        };
        let m = base.merged(&overlay);
        assert_eq!(m.model_ratio["wanx2.1-i2v-turbo"], 8.0);
        assert_eq!(m.model_ratio["wanx2.1-t2v-plus"], 16.0);
        assert_eq!(m.model_price["flat"], 1.0);
    }

    #[test]
    fn format_quota_in_dollars() {
        assert_eq!(format_quota(100_000, QPU), "$0.200000");
        assert_eq!(format_quota(0, QPU), "$0.000000");
    }

    #[test]
    fn handle_swaps_snapshot() {
        let h = PricingHandle::new(PricingTable::default());
        assert!(h.load().price("flat", "default").is_err());
        h.store(table());
        assert!(h.load().price("flat", "default").is_ok());
    }
}
