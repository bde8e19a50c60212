use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DISABLE_KEYWORDS: &[&str] = &[
    "your credit balance is too low",
    "this organization has been disabled.",
    "you exceeded your current quota",
    "permission denied",
    "the security token included in the request is invalid",
    "operation not allowed",
    "your account is not authorized",
];

/// Runtime tunables of the relay engine.
///
/// Stored as JSON inside the global config row; every field has a default so
/// partially written documents keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub quota_per_unit: f64,
    /// Token budget used for the pre-consume estimate when the caller sent no max_tokens.
    pub pre_consumed_quota: i64,
    pub default_max_tokens: u32,
    pub thinking_budget_percentage: f64,
    pub accept_unset_ratio_model: bool,
    pub retry_times: u32,
    pub sync_frequency_secs: u64,
    pub batch_update_enabled: bool,
    pub batch_update_interval_secs: u64,
    pub automatic_disable_channel: bool,
    pub automatic_enable_channel: bool,
    pub disable_keywords: Vec<String>,
    /// Probe latency above this disables the channel; 0 turns the check off.
    pub channel_disable_threshold_secs: f64,
    pub request_interval_ms: u64,
    /// 0 disables the scheduled sweep.
    pub auto_test_frequency_minutes: u64,
    pub notify_dedup_secs: u64,
    pub upstream_timeout_secs: u64,
    pub filter: FilterSettings,
    pub ratios: RatioTables,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            quota_per_unit: 500_000.0,
            pre_consumed_quota: 500,
            default_max_tokens: 8192,
            thinking_budget_percentage: 0.8,
            accept_unset_ratio_model: false,
            retry_times: 2,
            sync_frequency_secs: 60,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            automatic_disable_channel: true,
            automatic_enable_channel: true,
            disable_keywords: DEFAULT_DISABLE_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            channel_disable_threshold_secs: 5.0,
            request_interval_ms: 0,
            auto_test_frequency_minutes: 0,
            notify_dedup_secs: 3600,
            upstream_timeout_secs: 300,
            filter: FilterSettings::default(),
            ratios: RatioTables::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub enabled: bool,
    pub preflight_timeout_ms: u64,
    pub dictionaries: Vec<FilterDictionary>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            preflight_timeout_ms: 500,
            dictionaries: Vec::new(),
        }
    }
}

/// One named word list with its action (`BLOCK`, `REPLACE`, `CONTEXT`, `PASS`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDictionary {
    pub name: String,
    pub mode: String,
    pub words: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_suffix: Option<String>,
}

/// Billing ratio tables keyed by origin model name (group ratio keyed by group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioTables {
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub cache_ratio: HashMap<String, f64>,
    pub cache_creation_ratio: HashMap<String, f64>,
    pub model_price: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
}

impl Default for RatioTables {
    fn default() -> Self {
        let model_ratio = [
            ("gpt-4o", 1.25),
            ("gpt-4o-mini", 0.075),
            ("gpt-4.1", 1.0),
            ("text-embedding-3-small", 0.01),
            ("text-embedding-3-large", 0.065),
            ("claude-3-5-haiku-20241022", 0.4),
            ("claude-3-7-sonnet-20250219", 1.5),
            ("claude-sonnet-4-20250514", 1.5),
            ("claude-opus-4-20250514", 7.5),
            ("gemini-2.0-flash", 0.05),
            ("deepseek-chat", 0.135),
        ];
        let completion_ratio = [
            ("gpt-4o", 4.0),
            ("gpt-4o-mini", 4.0),
            ("gpt-4.1", 4.0),
            ("claude-3-5-haiku-20241022", 5.0),
            ("claude-3-7-sonnet-20250219", 5.0),
            ("claude-sonnet-4-20250514", 5.0),
            ("claude-opus-4-20250514", 5.0),
            ("gemini-2.0-flash", 4.0),
            ("deepseek-chat", 4.0),
        ];
        let to_map = |items: &[(&str, f64)]| {
            items
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<HashMap<_, _>>()
        };
        Self {
            model_ratio: to_map(&model_ratio),
            completion_ratio: to_map(&completion_ratio),
            cache_ratio: HashMap::new(),
            cache_creation_ratio: HashMap::new(),
            model_price: HashMap::new(),
            group_ratio: to_map(&[("default", 1.0), ("vip", 1.0)]),
        }
    }
}
