use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

/// Governor configuration, loaded from TOML with `TOLLGATE_*` env overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Upstream completion endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token. Usually supplied via `TOLLGATE_PROVIDER_API_KEY`.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
        }
    }
}

/// Capability registry: TTL tiers, probe timeout, and static-record overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CapabilityConfig {
    /// Age below which a cached record is served without a refresh.
    #[serde(default = "default_soft_ttl_secs")]
    pub soft_ttl_secs: u64,
    /// Age at or beyond which a cached record is replaced by a fallback.
    #[serde(default = "default_hard_ttl_secs")]
    pub hard_ttl_secs: u64,
    /// Per-probe timeout for metadata endpoints (warmup and refresh).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Override the context window of synthesized fallback records.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_override: Option<u32>,
    /// Override the per-request output cap of synthesized fallback records.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_override: Option<u32>,
    /// Fallback pricing overrides, USD per 1K tokens.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_per_1k_override: Option<f64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_per_1k_override: Option<f64>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_per_1k_override: Option<f64>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            soft_ttl_secs: default_soft_ttl_secs(),
            hard_ttl_secs: default_hard_ttl_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            context_window_override: None,
            max_output_override: None,
            input_per_1k_override: None,
            output_per_1k_override: None,
            reasoning_per_1k_override: None,
        }
    }
}

impl CapabilityConfig {
    pub fn soft_ttl(&self) -> Duration {
        Duration::from_secs(self.soft_ttl_secs)
    }

    pub fn hard_ttl(&self) -> Duration {
        Duration::from_secs(self.hard_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Token budget planner knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
    /// Tokens reserved on top of input + output when fitting the context
    /// window.
    #[serde(default = "default_safety_margin_tokens")]
    pub safety_margin_tokens: u32,
    /// Smallest output grant the planner will hand out; also the minimum
    /// viable output used when recommending a smaller request.
    #[serde(default = "default_min_output_tokens")]
    pub min_output_tokens: u32,
    /// Upper bound on auto-followed continuation segments per request.
    #[serde(default = "default_max_continuation_segments")]
    pub max_continuation_segments: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            safety_margin_tokens: default_safety_margin_tokens(),
            min_output_tokens: default_min_output_tokens(),
            max_continuation_segments: default_max_continuation_segments(),
        }
    }
}

/// Spending ceilings and ledger maintenance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    /// Default for requests that do not set `budget_guard_enabled`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ceiling on a single request's estimated cost (USD).
    #[serde(default = "default_request_max_usd")]
    pub request_max_usd: f64,
    /// Per-user ceiling over a rolling 24h window (USD).
    #[serde(default = "default_user_daily_max_usd")]
    pub user_daily_max_usd: f64,
    /// Site-wide ceiling over a rolling 1h window (USD).
    #[serde(default = "default_site_hourly_max_usd")]
    pub site_hourly_max_usd: f64,
    /// Usage records older than this are swept.
    #[serde(default = "default_ledger_retention_secs")]
    pub ledger_retention_secs: u64,
    /// Hard cap on ledger size; oldest records are evicted beyond it.
    #[serde(default = "default_ledger_max_records")]
    pub ledger_max_records: usize,
    /// Interval for the background ledger/cache sweepers.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_max_usd: default_request_max_usd(),
            user_daily_max_usd: default_user_daily_max_usd(),
            site_hourly_max_usd: default_site_hourly_max_usd(),
            ledger_retention_secs: default_ledger_retention_secs(),
            ledger_max_records: default_ledger_max_records(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl BudgetConfig {
    pub fn ledger_retention(&self) -> Duration {
        Duration::from_secs(self.ledger_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Resilient client: cache, concurrency, retry, timeout scaling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// Maximum number of cached responses before LRU eviction.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Cached responses expire after this many seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Maximum in-flight provider calls; overflow waits in the priority queue.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retry ceiling for retryable provider errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// When set, all timeout magnitudes are scaled up for long-output work.
    #[serde(default)]
    pub long_output_guard: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            long_output_guard: false,
        }
    }
}

impl ClientConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
const fn default_soft_ttl_secs() -> u64 {
    300
}
const fn default_hard_ttl_secs() -> u64 {
    3600
}
const fn default_probe_timeout_ms() -> u64 {
    2000
}
const fn default_safety_margin_tokens() -> u32 {
    128
}
const fn default_min_output_tokens() -> u32 {
    64
}
const fn default_max_continuation_segments() -> u32 {
    3
}
const fn default_true() -> bool {
    true
}
const fn default_request_max_usd() -> f64 {
    0.50
}
const fn default_user_daily_max_usd() -> f64 {
    10.0
}
const fn default_site_hourly_max_usd() -> f64 {
    25.0
}
const fn default_ledger_retention_secs() -> u64 {
    86_400
}
const fn default_ledger_max_records() -> usize {
    10_000
}
const fn default_sweep_interval_secs() -> u64 {
    300
}
const fn default_cache_capacity() -> usize {
    256
}
const fn default_cache_ttl_secs() -> u64 {
    600
}
const fn default_max_concurrent() -> usize {
    4
}
const fn default_max_retries() -> u32 {
    3
}
const fn default_retry_base_delay_ms() -> u64 {
    500
}
const fn default_retry_max_delay_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Config loading, env overrides, and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `TOLLGATE_` takes precedence over
    /// the file value.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        // -- Helpers (macros for concise per-field overrides) --

        macro_rules! env_str {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                }
            };
        }
        macro_rules! env_bool {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                }
            };
        }
        macro_rules! env_parse {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                    }
                }
            };
        }
        macro_rules! env_opt_str {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = if val.is_empty() { None } else { Some(val) };
                }
            };
        }
        macro_rules! env_opt_parse {
            ($env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = Some(parsed);
                    }
                }
            };
        }

        // -- Provider --
        env_str!("TOLLGATE_PROVIDER_BASE_URL", self.provider.base_url);
        env_opt_str!("TOLLGATE_PROVIDER_API_KEY", self.provider.api_key);

        // -- Capability --
        env_parse!("TOLLGATE_SOFT_TTL_SECS", self.capability.soft_ttl_secs);
        env_parse!("TOLLGATE_HARD_TTL_SECS", self.capability.hard_ttl_secs);
        env_parse!("TOLLGATE_PROBE_TIMEOUT_MS", self.capability.probe_timeout_ms);
        env_opt_parse!(
            "TOLLGATE_CONTEXT_WINDOW",
            self.capability.context_window_override
        );
        env_opt_parse!(
            "TOLLGATE_MAX_OUTPUT_TOKENS",
            self.capability.max_output_override
        );
        env_opt_parse!(
            "TOLLGATE_PRICE_INPUT_PER_1K",
            self.capability.input_per_1k_override
        );
        env_opt_parse!(
            "TOLLGATE_PRICE_OUTPUT_PER_1K",
            self.capability.output_per_1k_override
        );
        env_opt_parse!(
            "TOLLGATE_PRICE_REASONING_PER_1K",
            self.capability.reasoning_per_1k_override
        );

        // -- Planner --
        env_parse!(
            "TOLLGATE_SAFETY_MARGIN_TOKENS",
            self.planner.safety_margin_tokens
        );
        env_parse!("TOLLGATE_MIN_OUTPUT_TOKENS", self.planner.min_output_tokens);
        env_parse!(
            "TOLLGATE_MAX_CONTINUATION_SEGMENTS",
            self.planner.max_continuation_segments
        );

        // -- Budget --
        env_bool!("TOLLGATE_BUDGET_ENABLED", self.budget.enabled);
        env_parse!("TOLLGATE_REQUEST_MAX_USD", self.budget.request_max_usd);
        env_parse!("TOLLGATE_USER_DAILY_MAX_USD", self.budget.user_daily_max_usd);
        env_parse!(
            "TOLLGATE_SITE_HOURLY_MAX_USD",
            self.budget.site_hourly_max_usd
        );
        env_parse!(
            "TOLLGATE_LEDGER_RETENTION_SECS",
            self.budget.ledger_retention_secs
        );
        env_parse!(
            "TOLLGATE_LEDGER_MAX_RECORDS",
            self.budget.ledger_max_records
        );
        env_parse!(
            "TOLLGATE_SWEEP_INTERVAL_SECS",
            self.budget.sweep_interval_secs
        );

        // -- Client --
        env_bool!("TOLLGATE_CACHE_ENABLED", self.client.cache_enabled);
        env_parse!("TOLLGATE_CACHE_CAPACITY", self.client.cache_capacity);
        env_parse!("TOLLGATE_CACHE_TTL_SECS", self.client.cache_ttl_secs);
        env_parse!("TOLLGATE_MAX_CONCURRENT", self.client.max_concurrent);
        env_parse!("TOLLGATE_MAX_RETRIES", self.client.max_retries);
        env_parse!(
            "TOLLGATE_RETRY_BASE_DELAY_MS",
            self.client.retry_base_delay_ms
        );
        env_parse!(
            "TOLLGATE_RETRY_MAX_DELAY_MS",
            self.client.retry_max_delay_ms
        );
        env_bool!("TOLLGATE_LONG_OUTPUT_GUARD", self.client.long_output_guard);
    }

    /// Reject configurations that cannot work before any component is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capability.soft_ttl_secs >= self.capability.hard_ttl_secs {
            anyhow::bail!(
                "capability.soft_ttl_secs ({}) must be less than hard_ttl_secs ({})",
                self.capability.soft_ttl_secs,
                self.capability.hard_ttl_secs
            );
        }
        if self.capability.probe_timeout_ms == 0 {
            anyhow::bail!("capability.probe_timeout_ms must be positive");
        }
        if self.budget.request_max_usd <= 0.0
            || self.budget.user_daily_max_usd <= 0.0
            || self.budget.site_hourly_max_usd <= 0.0
        {
            anyhow::bail!("budget ceilings must be positive");
        }
        if self.budget.ledger_max_records == 0 {
            anyhow::bail!("budget.ledger_max_records must be positive");
        }
        if self.client.cache_enabled && self.client.cache_capacity == 0 {
            anyhow::bail!("client.cache_capacity must be positive when the cache is enabled");
        }
        if self.client.max_concurrent == 0 {
            anyhow::bail!("client.max_concurrent must be positive");
        }
        if self.planner.min_output_tokens == 0 {
            anyhow::bail!("planner.min_output_tokens must be positive");
        }
        url::Url::parse(&self.provider.base_url)
            .map_err(|e| anyhow::anyhow!("provider.base_url is not a valid URL: {e}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
