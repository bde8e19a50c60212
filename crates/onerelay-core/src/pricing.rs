//! Price lookup, pre-consume estimate and final settlement.

use onerelay_common::RelaySettings;
use onerelay_provider_core::{CallerInfo, PriceData, RelayError, Usage};

/// Ratio used for models without a configured ratio when unset models are accepted.
pub const UNSET_MODEL_RATIO: f64 = 37.5;
const DEFAULT_CACHE_RATIO: f64 = 1.0;
const DEFAULT_CACHE_CREATION_RATIO: f64 = 1.25;

pub fn group_ratio(settings: &RelaySettings, group: &str) -> f64 {
    settings
        .ratios
        .group_ratio
        .get(group)
        .copied()
        .unwrap_or(1.0)
}

/// Resolves the billing parameters of `model` and the quota to reserve up front.
///
/// `max_tokens == 0` reserves the configured `pre_consumed_quota` token budget
/// instead of `prompt + max_tokens`.
pub fn model_price_data(
    settings: &RelaySettings,
    caller: &CallerInfo,
    model: &str,
    prompt_tokens: i64,
    max_tokens: i64,
) -> Result<PriceData, RelayError> {
    let ratios = &settings.ratios;
    let group_ratio = group_ratio(settings, &caller.group);

    if let Some(price) = ratios.model_price.get(model).copied() {
        return Ok(PriceData {
            model_price: price,
            group_ratio,
            use_price: true,
            pre_consumed_quota: (price * settings.quota_per_unit * group_ratio) as i64,
            ..Default::default()
        });
    }

    let model_ratio = match ratios.model_ratio.get(model).copied() {
        Some(ratio) => ratio,
        None if settings.accept_unset_ratio_model || caller.accept_unset_ratio_model => {
            UNSET_MODEL_RATIO
        }
        None => return Err(unset_ratio_error(model, caller.is_root)),
    };

    let tokens = if max_tokens != 0 {
        prompt_tokens + max_tokens
    } else {
        settings.pre_consumed_quota
    };
    Ok(PriceData {
        model_price: 0.0,
        model_ratio,
        completion_ratio: ratios.completion_ratio.get(model).copied().unwrap_or(1.0),
        cache_ratio: ratios
            .cache_ratio
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_CACHE_RATIO),
        cache_creation_ratio: ratios
            .cache_creation_ratio
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_CACHE_CREATION_RATIO),
        group_ratio,
        use_price: false,
        pre_consumed_quota: (tokens as f64 * model_ratio * group_ratio) as i64,
    })
}

fn unset_ratio_error(model: &str, is_root: bool) -> RelayError {
    let message = if is_root {
        format!(
            "model {model} has no ratio or price configured; set it on the ratio settings page \
             or enable accept_unset_ratio_model"
        )
    } else {
        format!("model {model} has no ratio or price configured, please contact the administrator")
    };
    RelayError::config("model_price_error", message)
}

/// Final quota for one call.
///
/// Price mode bills `price × quota_per_unit` regardless of group.
///
/// Cache reads and cache writes are billed at their own ratios instead of the
/// plain prompt rate; `usage.prompt_tokens` includes both segments.
pub fn settle_quota(price: &PriceData, usage: &Usage, quota_per_unit: f64) -> i64 {
    if price.use_price {
        return (price.model_price * quota_per_unit) as i64;
    }

    let cached = usage.cached_tokens.max(0);
    let creation = usage.cache_creation_tokens.max(0);
    let plain_prompt = (usage.prompt_tokens - cached - creation).max(0);
    let tokens = plain_prompt as f64
        + cached as f64 * price.cache_ratio
        + creation as f64 * price.cache_creation_ratio
        + usage.completion_tokens as f64 * price.completion_ratio;
    let quota = (tokens * price.model_ratio * price.group_ratio).round() as i64;

    if price.model_ratio != 0.0 && quota <= 0 {
        1
    } else {
        quota
    }
}

/// Human readable billing note stored with the consumption record.
pub fn describe(price: &PriceData) -> String {
    if price.use_price {
        format!(
            "model price {:.4}, group ratio {:.2}",
            price.model_price, price.group_ratio
        )
    } else {
        format!(
            "model ratio {:.4}, completion ratio {:.2}, cache ratio {:.2}, group ratio {:.2}",
            price.model_ratio, price.completion_ratio, price.cache_ratio, price.group_ratio
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(is_root: bool) -> CallerInfo {
        CallerInfo {
            user_id: 1,
            token_id: 1,
            token_name: "t".to_string(),
            group: "vip".to_string(),
            is_root,
            token_unlimited: false,
            accept_unset_ratio_model: false,
        }
    }

    fn settings() -> RelaySettings {
        let mut settings = RelaySettings::default();
        settings.ratios.model_ratio.insert("m".to_string(), 2.0);
        settings.ratios.completion_ratio.insert("m".to_string(), 1.0);
        settings.ratios.group_ratio.insert("vip".to_string(), 1.5);
        settings
    }

    #[test]
    fn ratio_settlement_multiplies_ratios() {
        let price = model_price_data(&settings(), &caller(false), "m", 100, 50).unwrap();
        assert_eq!(price.pre_consumed_quota, 450);
        let quota = settle_quota(&price, &Usage::new(100, 50), 500_000.0);
        assert_eq!(quota, 450);
    }

    #[test]
    fn tiny_calls_cost_at_least_one() {
        let mut price = model_price_data(&settings(), &caller(false), "m", 0, 0).unwrap();
        price.model_ratio = 0.0001;
        assert_eq!(settle_quota(&price, &Usage::new(1, 0), 500_000.0), 1);
        price.model_ratio = 0.0;
        assert_eq!(settle_quota(&price, &Usage::new(1, 0), 500_000.0), 0);
    }

    #[test]
    fn cache_segments_use_their_own_ratios() {
        let mut settings = settings();
        settings.ratios.cache_ratio.insert("m".to_string(), 0.1);
        settings.ratios.cache_creation_ratio.insert("m".to_string(), 1.25);
        let price = model_price_data(&settings, &caller(false), "m", 0, 0).unwrap();
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 0,
            total_tokens: 1000,
            cached_tokens: 600,
            cache_creation_tokens: 200,
            reasoning_tokens: 0,
        };
        // (200 + 600 * 0.1 + 200 * 1.25) * 2.0 * 1.5
        assert_eq!(settle_quota(&price, &usage, 500_000.0), 1530);
    }

    #[test]
    fn missing_max_tokens_reserves_default_budget() {
        let price = model_price_data(&settings(), &caller(false), "m", 100, 0).unwrap();
        assert_eq!(price.pre_consumed_quota, (500.0 * 2.0 * 1.5) as i64);
    }

    #[test]
    fn price_mode_bills_per_call() {
        let mut settings = settings();
        settings.ratios.model_price.insert("dall-e-3".to_string(), 0.04);
        let price = model_price_data(&settings, &caller(false), "dall-e-3", 10, 0).unwrap();
        assert!(price.use_price);
        assert_eq!(price.pre_consumed_quota, 30_000);
        assert_eq!(settle_quota(&price, &Usage::new(10, 0), 500_000.0), 20_000);
    }

    #[test]
    fn unset_models_are_config_errors_unless_accepted() {
        let err = model_price_data(&settings(), &caller(true), "unknown", 1, 1).unwrap_err();
        assert!(err.is_local());
        assert!(err.message.contains("settings page"));
        let err = model_price_data(&settings(), &caller(false), "unknown", 1, 1).unwrap_err();
        assert!(err.message.contains("administrator"));

        let mut accepting = caller(false);
        accepting.accept_unset_ratio_model = true;
        let price = model_price_data(&settings(), &accepting, "unknown", 1, 1).unwrap();
        assert_eq!(price.model_ratio, UNSET_MODEL_RATIO);
    }
}
