use chrono::Utc;

use super::{CapabilityRecord, Pricing, Provenance, RateLimit};
use crate::config::CapabilityConfig;

// ---------------------------------------------------------------------------
// Static model-family defaults
// ---------------------------------------------------------------------------

/// Baseline capability values for a model family, used when nothing has been
/// detected from the provider yet.
#[derive(Debug, Clone, Copy)]
pub struct FamilyDefaults {
    pub context_window_tokens: u32,
    pub max_output_tokens_per_request: u32,
    pub supports_reasoning: bool,
    pub requests_per_second: f64,
    pub tokens_per_minute: u64,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub reasoning_per_1k: f64,
}

/// Known families, matched by substring against the model id. Order matters:
/// more specific entries come before their prefixes ("gpt-4o-mini" before
/// "gpt-4o").
const FAMILY_DEFAULTS: &[(&str, FamilyDefaults)] = &[
    (
        "gpt-4o-mini",
        FamilyDefaults {
            context_window_tokens: 128_000,
            max_output_tokens_per_request: 16_384,
            supports_reasoning: false,
            requests_per_second: 50.0,
            tokens_per_minute: 2_000_000,
            input_per_1k: 0.000_15,
            output_per_1k: 0.000_60,
            reasoning_per_1k: 0.0,
        },
    ),
    (
        "gpt-4o",
        FamilyDefaults {
            context_window_tokens: 128_000,
            max_output_tokens_per_request: 16_384,
            supports_reasoning: false,
            requests_per_second: 50.0,
            tokens_per_minute: 800_000,
            input_per_1k: 0.002_5,
            output_per_1k: 0.010,
            reasoning_per_1k: 0.0,
        },
    ),
    (
        "gpt-4.1",
        FamilyDefaults {
            context_window_tokens: 1_000_000,
            max_output_tokens_per_request: 32_768,
            supports_reasoning: false,
            requests_per_second: 50.0,
            tokens_per_minute: 800_000,
            input_per_1k: 0.002,
            output_per_1k: 0.008,
            reasoning_per_1k: 0.0,
        },
    ),
    (
        "o3",
        FamilyDefaults {
            context_window_tokens: 200_000,
            max_output_tokens_per_request: 100_000,
            supports_reasoning: true,
            requests_per_second: 10.0,
            tokens_per_minute: 400_000,
            input_per_1k: 0.002,
            output_per_1k: 0.008,
            reasoning_per_1k: 0.008,
        },
    ),
    (
        "o1",
        FamilyDefaults {
            context_window_tokens: 200_000,
            max_output_tokens_per_request: 100_000,
            supports_reasoning: true,
            requests_per_second: 10.0,
            tokens_per_minute: 400_000,
            input_per_1k: 0.015,
            output_per_1k: 0.060,
            reasoning_per_1k: 0.060,
        },
    ),
    (
        "claude",
        FamilyDefaults {
            context_window_tokens: 200_000,
            max_output_tokens_per_request: 8_192,
            supports_reasoning: true,
            requests_per_second: 50.0,
            tokens_per_minute: 400_000,
            input_per_1k: 0.003,
            output_per_1k: 0.015,
            reasoning_per_1k: 0.015,
        },
    ),
    (
        "gemini",
        FamilyDefaults {
            context_window_tokens: 1_000_000,
            max_output_tokens_per_request: 8_192,
            supports_reasoning: false,
            requests_per_second: 25.0,
            tokens_per_minute: 1_000_000,
            input_per_1k: 0.001_25,
            output_per_1k: 0.005,
            reasoning_per_1k: 0.0,
        },
    ),
    (
        "deepseek",
        FamilyDefaults {
            context_window_tokens: 64_000,
            max_output_tokens_per_request: 8_192,
            supports_reasoning: true,
            requests_per_second: 25.0,
            tokens_per_minute: 500_000,
            input_per_1k: 0.000_14,
            output_per_1k: 0.000_28,
            reasoning_per_1k: 0.000_55,
        },
    ),
    (
        "llama",
        FamilyDefaults {
            context_window_tokens: 128_000,
            max_output_tokens_per_request: 4_096,
            supports_reasoning: false,
            requests_per_second: 25.0,
            tokens_per_minute: 500_000,
            input_per_1k: 0.000_2,
            output_per_1k: 0.000_2,
            reasoning_per_1k: 0.0,
        },
    ),
    (
        "mistral",
        FamilyDefaults {
            context_window_tokens: 32_768,
            max_output_tokens_per_request: 8_192,
            supports_reasoning: false,
            requests_per_second: 25.0,
            tokens_per_minute: 500_000,
            input_per_1k: 0.000_2,
            output_per_1k: 0.000_6,
            reasoning_per_1k: 0.0,
        },
    ),
];

/// Conservative values for models no family entry matches.
const GENERIC_DEFAULTS: FamilyDefaults = FamilyDefaults {
    context_window_tokens: 8_192,
    max_output_tokens_per_request: 2_048,
    supports_reasoning: false,
    requests_per_second: 10.0,
    tokens_per_minute: 100_000,
    input_per_1k: 0.001,
    output_per_1k: 0.002,
    reasoning_per_1k: 0.0,
};

/// Look up family defaults for a model id. First matching entry wins;
/// unknown models get the conservative generic row.
pub fn defaults_for(model_id: &str) -> FamilyDefaults {
    let id = model_id.to_lowercase();
    FAMILY_DEFAULTS
        .iter()
        .find(|(family, _)| id.contains(family))
        .map(|(_, defaults)| *defaults)
        .unwrap_or(GENERIC_DEFAULTS)
}

/// Build a fallback record: family defaults with configured overrides
/// applied on top. The output cap is clamped to the context window.
pub fn synthesize(model_id: &str, config: &CapabilityConfig) -> CapabilityRecord {
    let defaults = defaults_for(model_id);

    let context_window_tokens = config
        .context_window_override
        .unwrap_or(defaults.context_window_tokens);
    let max_output = config
        .max_output_override
        .unwrap_or(defaults.max_output_tokens_per_request);

    CapabilityRecord {
        model_id: model_id.to_string(),
        context_window_tokens,
        max_output_tokens_per_request: max_output.min(context_window_tokens),
        supports_reasoning: defaults.supports_reasoning,
        rate_limit: RateLimit {
            requests_per_second: defaults.requests_per_second,
            tokens_per_minute: defaults.tokens_per_minute,
        },
        pricing: Pricing {
            input_per_1k: config.input_per_1k_override.unwrap_or(defaults.input_per_1k),
            output_per_1k: config
                .output_per_1k_override
                .unwrap_or(defaults.output_per_1k),
            reasoning_per_1k: config
                .reasoning_per_1k_override
                .unwrap_or(defaults.reasoning_per_1k),
        },
        last_updated_at: Utc::now(),
        provenance: Provenance::Fallback,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
