//! Per-model pricing table: input/output/cache-create/cache-read rates per
//! 1k tokens, with an optional per-account multiplier folded in last.

use std::collections::HashMap;

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub cache_create_per_1k: f64,
    pub cache_read_per_1k: f64,
}

static RATES: Lazy<HashMap<&'static str, ModelRate>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "claude-sonnet-4-5-20250929",
        ModelRate { input_per_1k: 3.0, output_per_1k: 15.0, cache_create_per_1k: 3.75, cache_read_per_1k: 0.30 },
    );
    m.insert(
        "claude-opus-4-1-20250805",
        ModelRate { input_per_1k: 15.0, output_per_1k: 75.0, cache_create_per_1k: 18.75, cache_read_per_1k: 1.50 },
    );
    m.insert(
        "claude-haiku-4-5-20251001",
        ModelRate { input_per_1k: 0.80, output_per_1k: 4.0, cache_create_per_1k: 1.0, cache_read_per_1k: 0.08 },
    );
    m
});

const FALLBACK_RATE: ModelRate =
    ModelRate { input_per_1k: 3.0, output_per_1k: 15.0, cache_create_per_1k: 3.75, cache_read_per_1k: 0.30 };

/// Looks up a model's rate by exact name, then by "main model" family
/// prefix (the dated suffix dropped), then falls back to the Sonnet rate
/// so an unrecognized model is billed rather than free.
pub fn rate_for_model(model: &str) -> ModelRate {
    if let Some(rate) = RATES.get(model) {
        return *rate;
    }
    for (name, rate) in RATES.iter() {
        if model.starts_with(name.split("-2").next().unwrap_or(name)) {
            return *rate;
        }
    }
    FALLBACK_RATE
}

/// Cost in USD for one usage event, in units of 1k tokens, with an
/// optional per-account multiplier applied last (never in the request
/// path — it is a property of the serving account, not the caller).
pub fn cost_usd(
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
    cache_create_tokens: i64,
    cache_read_tokens: i64,
    account_multiplier: Option<f64>,
) -> f64 {
    let rate = rate_for_model(model);
    let base = (input_tokens as f64 / 1000.0) * rate.input_per_1k
        + (output_tokens as f64 / 1000.0) * rate.output_per_1k
        + (cache_create_tokens as f64 / 1000.0) * rate.cache_create_per_1k
        + (cache_read_tokens as f64 / 1000.0) * rate.cache_read_per_1k;
    base * account_multiplier.unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_uses_its_own_rate() {
        let cost = cost_usd("claude-sonnet-4-5-20250929", 1000, 1000, 0, 0, None);
        assert!((cost - (3.0 + 15.0)).abs() < 1e-9);
    }

    #[test]
    fn account_multiplier_applies_after_base_cost() {
        let full = cost_usd("claude-sonnet-4-5-20250929", 1000, 0, 0, 0, None);
        let discounted = cost_usd("claude-sonnet-4-5-20250929", 1000, 0, 0, 0, Some(0.3));
        assert!((discounted - full * 0.3).abs() < 1e-9);
    }

    #[test]
    fn unrecognized_model_still_bills_via_fallback() {
        let cost = cost_usd("some-unknown-model", 1000, 0, 0, 0, None);
        assert!(cost > 0.0);
    }
}
