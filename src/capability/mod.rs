//! Capability registry: what each model can do and what it costs.
//!
//! `get` is the hot-path entry point and never waits on the network. Cached
//! records age through two TTL tiers: fresh records are served as-is, stale
//! records are served while a background refresh runs, and expired or unknown
//! models get a synthesized fallback record until a probe succeeds.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod defaults;
pub mod probe;

pub use probe::{CapabilityProbe, HttpProbe, ProbedMetadata};

use crate::config::CapabilityConfig;

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Where a capability record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Read from the provider's metadata endpoints.
    Detected,
    /// Synthesized from the static defaults table and config overrides.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub tokens_per_minute: u64,
}

/// USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub reasoning_per_1k: f64,
}

/// Everything the planner and guardian need to know about a model. Callers
/// receive an owned snapshot; registry updates never mutate a handed-out
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub model_id: String,
    pub context_window_tokens: u32,
    /// Invariant: never exceeds `context_window_tokens`.
    pub max_output_tokens_per_request: u32,
    pub supports_reasoning: bool,
    pub rate_limit: RateLimit,
    pub pricing: Pricing,
    pub last_updated_at: DateTime<Utc>,
    pub provenance: Provenance,
}

struct StoredRecord {
    record: CapabilityRecord,
    fetched_at: Instant,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared capability store. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    records: Mutex<HashMap<String, StoredRecord>>,
    /// Models with a refresh probe currently in flight.
    inflight: Mutex<HashSet<String>>,
    probe: Arc<dyn CapabilityProbe>,
    config: CapabilityConfig,
}

impl CapabilityRegistry {
    pub fn new(config: CapabilityConfig, probe: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                records: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashSet::new()),
                probe,
                config,
            }),
        }
    }

    /// Resolve a model's capability record. Never fails and never waits on
    /// the network: stale and unknown models are answered immediately from
    /// cache or fallback synthesis while a refresh runs in the background.
    pub fn get(&self, model_id: &str) -> CapabilityRecord {
        let cached = {
            let records = self
                .inner
                .records
                .lock()
                .expect("capability registry mutex poisoned");
            records
                .get(model_id)
                .map(|stored| (stored.record.clone(), stored.fetched_at.elapsed()))
        };

        match cached {
            Some((record, age)) if age < self.inner.config.soft_ttl() => record,
            Some((record, age)) if age < self.inner.config.hard_ttl() => {
                self.spawn_refresh(model_id);
                record
            }
            _ => {
                let record = defaults::synthesize(model_id, &self.inner.config);
                {
                    let mut records = self
                        .inner
                        .records
                        .lock()
                        .expect("capability registry mutex poisoned");
                    records.insert(
                        model_id.to_string(),
                        StoredRecord {
                            record: record.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                self.spawn_refresh(model_id);
                record
            }
        }
    }

    /// Pre-fill records for the given models, probing them in parallel with
    /// the configured per-probe timeout. Failures are logged and leave the
    /// registry unchanged.
    pub async fn warmup(&self, model_ids: &[String]) {
        let probes = model_ids.iter().map(|model_id| async move {
            let timeout = self.inner.config.probe_timeout();
            match tokio::time::timeout(timeout, self.inner.probe.probe(model_id)).await {
                Ok(Ok(meta)) => {
                    self.inner.store_detected(model_id, meta);
                    tracing::info!(model = %model_id, "Capability warmup succeeded");
                }
                Ok(Err(e)) => {
                    tracing::warn!(model = %model_id, error = %e, "Capability warmup probe failed");
                }
                Err(_) => {
                    tracing::warn!(model = %model_id, "Capability warmup probe timed out");
                }
            }
        });
        futures::future::join_all(probes).await;
    }

    /// Kick off a background refresh unless one is already running for this
    /// model. Outside a tokio runtime this is a no-op; `get` stays usable
    /// from synchronous contexts.
    fn spawn_refresh(&self, model_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .expect("capability registry mutex poisoned");
            if !inflight.insert(model_id.to_string()) {
                return;
            }
        }

        let inner = Arc::clone(&self.inner);
        let model_id = model_id.to_string();
        handle.spawn(async move {
            let timeout = inner.config.probe_timeout();
            match tokio::time::timeout(timeout, inner.probe.probe(&model_id)).await {
                Ok(Ok(meta)) => {
                    inner.store_detected(&model_id, meta);
                    tracing::debug!(model = %model_id, "Capability record refreshed");
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        model = %model_id,
                        error = %e,
                        "Capability refresh failed, keeping existing record"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        model = %model_id,
                        "Capability refresh timed out, keeping existing record"
                    );
                }
            }
            inner
                .inflight
                .lock()
                .expect("capability registry mutex poisoned")
                .remove(&model_id);
        });
    }
}

impl RegistryInner {
    /// Store a probed record, filling unreported fields from the fallback
    /// values for this model.
    fn store_detected(&self, model_id: &str, meta: ProbedMetadata) {
        let base = defaults::synthesize(model_id, &self.config);
        let context = meta
            .context_window_tokens
            .unwrap_or(base.context_window_tokens);
        let max_output = meta
            .max_output_tokens
            .unwrap_or(base.max_output_tokens_per_request);

        let record = CapabilityRecord {
            model_id: model_id.to_string(),
            context_window_tokens: context,
            max_output_tokens_per_request: max_output.min(context),
            supports_reasoning: meta.supports_reasoning.unwrap_or(base.supports_reasoning),
            rate_limit: RateLimit {
                requests_per_second: meta
                    .requests_per_second
                    .unwrap_or(base.rate_limit.requests_per_second),
                tokens_per_minute: meta
                    .tokens_per_minute
                    .unwrap_or(base.rate_limit.tokens_per_minute),
            },
            pricing: Pricing {
                input_per_1k: meta.input_per_1k.unwrap_or(base.pricing.input_per_1k),
                output_per_1k: meta.output_per_1k.unwrap_or(base.pricing.output_per_1k),
                reasoning_per_1k: meta
                    .reasoning_per_1k
                    .unwrap_or(base.pricing.reasoning_per_1k),
            },
            last_updated_at: Utc::now(),
            provenance: Provenance::Detected,
        };

        let mut records = self
            .records
            .lock()
            .expect("capability registry mutex poisoned");
        records.insert(
            model_id.to_string(),
            StoredRecord {
                record,
                fetched_at: Instant::now(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    struct StaticProbe {
        meta: ProbedMetadata,
        delay: Duration,
        calls: Arc<AtomicU32>,
    }

    impl CapabilityProbe for StaticProbe {
        fn probe<'a>(
            &'a self,
            _model_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<ProbedMetadata>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let meta = self.meta.clone();
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(meta)
            })
        }
    }

    struct HangingProbe;

    impl CapabilityProbe for HangingProbe {
        fn probe<'a>(
            &'a self,
            _model_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<ProbedMetadata>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    fn config(soft_secs: u64) -> CapabilityConfig {
        CapabilityConfig {
            soft_ttl_secs: soft_secs,
            hard_ttl_secs: 3600,
            probe_timeout_ms: 1000,
            ..CapabilityConfig::default()
        }
    }

    fn registry_with(probe: impl CapabilityProbe + 'static, soft_secs: u64) -> CapabilityRegistry {
        CapabilityRegistry::new(config(soft_secs), Arc::new(probe))
    }

    #[test]
    fn test_get_works_without_a_runtime() {
        // No tokio runtime here: refresh spawning must silently no-op.
        let registry = registry_with(HangingProbe, 300);
        let record = registry.get("unknown-model");
        assert_eq!(record.provenance, Provenance::Fallback);
        assert_eq!(record.context_window_tokens, 8_192);
        assert!(record.max_output_tokens_per_request <= record.context_window_tokens);
    }

    #[tokio::test]
    async fn test_get_is_bounded_despite_hanging_probe() {
        let registry = registry_with(HangingProbe, 300);
        let start = Instant::now();
        let record = registry.get("demo-chat");
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(record.provenance, Provenance::Fallback);

        // Still bounded on the stale path.
        let again = registry.get("demo-chat");
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(again.model_id, "demo-chat");
    }

    #[tokio::test]
    async fn test_fresh_record_served_without_probing() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = registry_with(
            StaticProbe {
                meta: ProbedMetadata {
                    context_window_tokens: Some(50_000),
                    ..ProbedMetadata::default()
                },
                delay: Duration::ZERO,
                calls: Arc::clone(&calls),
            },
            300,
        );

        registry.warmup(&["demo-chat".to_string()]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let record = registry.get("demo-chat");
        assert_eq!(record.provenance, Provenance::Detected);
        assert_eq!(record.context_window_tokens, 50_000);
        // Fresh tier: no new probe.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_record_refreshes_in_background_once() {
        let calls = Arc::new(AtomicU32::new(0));
        // soft TTL of zero makes every cached record immediately stale.
        let registry = registry_with(
            StaticProbe {
                meta: ProbedMetadata::default(),
                delay: Duration::from_millis(100),
                calls: Arc::clone(&calls),
            },
            0,
        );

        let first = registry.get("demo-chat");
        let second = registry.get("demo-chat");
        assert_eq!(first.provenance, Provenance::Fallback);
        assert_eq!(second.provenance, Provenance::Fallback);

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Both gets raced for a refresh; deduplication allowed only one.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let third = registry.get("demo-chat");
        assert_eq!(third.provenance, Provenance::Detected);
    }

    #[tokio::test]
    async fn test_detected_record_merges_probe_fields_over_fallback() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = registry_with(
            StaticProbe {
                meta: ProbedMetadata {
                    context_window_tokens: Some(50_000),
                    input_per_1k: Some(0.009),
                    ..ProbedMetadata::default()
                },
                delay: Duration::ZERO,
                calls,
            },
            300,
        );

        registry.warmup(&["custom-model".to_string()]).await;
        let record = registry.get("custom-model");

        assert_eq!(record.context_window_tokens, 50_000);
        assert_eq!(record.pricing.input_per_1k, 0.009);
        // Unreported fields keep the fallback values for this model.
        assert_eq!(record.max_output_tokens_per_request, 2_048);
        assert_eq!(record.pricing.output_per_1k, 0.002);
        assert_eq!(record.provenance, Provenance::Detected);
    }

    #[tokio::test]
    async fn test_warmup_timeout_is_bounded_and_leaves_no_record() {
        let registry = CapabilityRegistry::new(
            CapabilityConfig {
                probe_timeout_ms: 50,
                ..config(300)
            },
            Arc::new(HangingProbe),
        );

        let start = Instant::now();
        registry
            .warmup(&["a".to_string(), "b".to_string()])
            .await;
        // Parallel probes: total wait is one timeout, not one per model.
        assert!(start.elapsed() < Duration::from_millis(500));

        assert_eq!(registry.get("a").provenance, Provenance::Fallback);
    }
}
