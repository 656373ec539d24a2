//! Cost guardian: spending ceilings, optimistic admission, and post-call
//! reconciliation.
//!
//! Admission reserves the estimated cost up front (optimistic debit) so
//! concurrent requests cannot collectively overshoot a ceiling; the actual
//! cost is settled against the reservation once the provider reports usage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

pub mod ledger;

pub use ledger::UsageRecord;

use crate::capability::{CapabilityRecord, Pricing};
use crate::config::BudgetConfig;
use crate::error::GovernorError;
use crate::types::Usage;
use ledger::UsageLedger;

/// Rolling window for per-user ceilings.
const USER_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Rolling window for the site-wide ceiling.
const SITE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Floor for recommended output sizes; anything smaller is not worth running.
const MIN_VIABLE_OUTPUT_TOKENS: u64 = 16;

// ---------------------------------------------------------------------------
// Cost estimation
// ---------------------------------------------------------------------------

/// Estimated USD cost for a call at the given pricing.
pub fn estimate_cost(
    pricing: &Pricing,
    input_tokens: u64,
    output_tokens: u64,
    reasoning_tokens: u64,
) -> f64 {
    input_tokens as f64 / 1000.0 * pricing.input_per_1k
        + output_tokens as f64 / 1000.0 * pricing.output_per_1k
        + reasoning_tokens as f64 / 1000.0 * pricing.reasoning_per_1k
}

fn validate_token_counts(input: i64, output: i64, reasoning: i64) -> Result<(), GovernorError> {
    if input < 0 || output < 0 || reasoning < 0 {
        return Err(GovernorError::InvalidRequest(format!(
            "token counts must be non-negative (input {input}, output {output}, reasoning {reasoning})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decision and snapshot types
// ---------------------------------------------------------------------------

/// Outcome of a ceiling check. `allowed == false` is a denial, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreflightDecision {
    pub allowed: bool,
    pub estimated_cost: f64,
    /// Every failed ceiling, enumerated in check order, when denied.
    pub reason: Option<String>,
    /// For per-request ceiling failures: an output size that would fit,
    /// strictly below what was asked for.
    pub recommended_output_tokens: Option<u32>,
    pub suggestions: Vec<String>,
    /// Time until the binding window resets, for window-based denials.
    pub retry_after: Option<Duration>,
}

/// Per-user spend overview for operator display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSpendSnapshot {
    pub user_id: String,
    pub spent_today_usd: f64,
    pub remaining_today_usd: f64,
    pub window_resets_in: Duration,
}

// ---------------------------------------------------------------------------
// Spending counters
// ---------------------------------------------------------------------------

/// Accumulated spend over a rolling window, reset lazily on access.
#[derive(Debug)]
struct SpendingCounter {
    accumulated_usd: f64,
    window_started_at: Instant,
}

impl SpendingCounter {
    fn new() -> Self {
        Self {
            accumulated_usd: 0.0,
            window_started_at: Instant::now(),
        }
    }

    /// Current spend, resetting first if the window has elapsed.
    fn current(&mut self, window: Duration) -> f64 {
        if self.window_started_at.elapsed() >= window {
            self.accumulated_usd = 0.0;
            self.window_started_at = Instant::now();
        }
        self.accumulated_usd
    }

    /// Apply a delta (debit or refund). Spend never goes below zero.
    fn add(&mut self, window: Duration, amount: f64) {
        self.current(window);
        self.accumulated_usd = (self.accumulated_usd + amount).max(0.0);
    }

    fn window_remaining(&self, window: Duration) -> Duration {
        window.saturating_sub(self.window_started_at.elapsed())
    }

    fn window_elapsed(&self, window: Duration) -> bool {
        self.window_started_at.elapsed() >= window
    }
}

// ---------------------------------------------------------------------------
// Guardian
// ---------------------------------------------------------------------------

struct GuardianState {
    ledger: UsageLedger,
    user_counters: HashMap<String, SpendingCounter>,
    site_counter: SpendingCounter,
}

impl GuardianState {
    fn user_counter(&mut self, user_id: &str) -> &mut SpendingCounter {
        self.user_counters
            .entry(user_id.to_string())
            .or_insert_with(SpendingCounter::new)
    }
}

/// Shared spending guard. Cloning is cheap; clones share counters and ledger.
#[derive(Clone)]
pub struct CostGuardian {
    state: Arc<Mutex<GuardianState>>,
    config: BudgetConfig,
}

impl CostGuardian {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardianState {
                ledger: UsageLedger::new(config.ledger_max_records),
                user_counters: HashMap::new(),
                site_counter: SpendingCounter::new(),
            })),
            config,
        }
    }

    /// Check a prospective call against all three ceilings without recording
    /// anything. Idempotent for identical arguments as long as no usage is
    /// recorded in between. Negative token counts are caller errors.
    pub fn preflight(
        &self,
        user_id: &str,
        capability: &CapabilityRecord,
        input_tokens: i64,
        target_output_tokens: i64,
        reasoning_tokens: i64,
    ) -> Result<PreflightDecision, GovernorError> {
        validate_token_counts(input_tokens, target_output_tokens, reasoning_tokens)?;
        let mut state = self.state.lock().expect("cost guardian mutex poisoned");
        Ok(self.decide(
            &mut state,
            user_id,
            capability,
            input_tokens as u64,
            target_output_tokens as u64,
            reasoning_tokens as u64,
        ))
    }

    /// Preflight plus, in the same critical section, the usage record and
    /// optimistic debit. Serializing check and debit under one lock keeps
    /// concurrent admissions from overshooting a ceiling together.
    pub fn admit(
        &self,
        request_id: &str,
        user_id: &str,
        capability: &CapabilityRecord,
        input_tokens: i64,
        target_output_tokens: i64,
        reasoning_tokens: i64,
    ) -> Result<PreflightDecision, GovernorError> {
        validate_token_counts(input_tokens, target_output_tokens, reasoning_tokens)?;
        let mut state = self.state.lock().expect("cost guardian mutex poisoned");
        let decision = self.decide(
            &mut state,
            user_id,
            capability,
            input_tokens as u64,
            target_output_tokens as u64,
            reasoning_tokens as u64,
        );
        Self::record_locked(
            &mut state,
            request_id,
            user_id,
            decision.estimated_cost,
            decision.allowed,
        );

        if decision.allowed {
            tracing::debug!(
                request_id = %request_id,
                user_id = %user_id,
                estimated_cost = %format!("${:.6}", decision.estimated_cost),
                "Request admitted"
            );
        } else {
            tracing::info!(
                request_id = %request_id,
                user_id = %user_id,
                reason = decision.reason.as_deref().unwrap_or(""),
                "Request denied by budget guard"
            );
        }
        Ok(decision)
    }

    /// Append a usage record; approved records debit the estimate to the
    /// user and site counters immediately.
    pub fn record_usage(
        &self,
        request_id: &str,
        user_id: &str,
        estimated_cost: f64,
        approved: bool,
    ) {
        let mut state = self.state.lock().expect("cost guardian mutex poisoned");
        Self::record_locked(&mut state, request_id, user_id, estimated_cost, approved);
    }

    /// Settle a request against provider-reported usage: the difference
    /// between actual and estimated cost is applied to the counters and the
    /// record is marked completed. Later calls for the same request are
    /// ignored, as are unknown request ids.
    pub fn reconcile(&self, request_id: &str, actual: &Usage, capability: &CapabilityRecord) {
        let mut state = self.state.lock().expect("cost guardian mutex poisoned");

        let (user_id, delta, approved, actual_cost) = {
            let Some(record) = state.ledger.get_mut(request_id) else {
                tracing::warn!(request_id = %request_id, "Reconcile for unknown request id, ignoring");
                return;
            };
            if record.completed {
                tracing::debug!(request_id = %request_id, "Request already reconciled, ignoring");
                return;
            }
            let actual_cost = estimate_cost(
                &capability.pricing,
                u64::from(actual.prompt_tokens),
                u64::from(actual.completion_tokens),
                u64::from(actual.reasoning()),
            );
            record.actual_cost = Some(actual_cost);
            record.completed = true;
            (
                record.user_id.clone(),
                actual_cost - record.estimated_cost,
                record.approved,
                actual_cost,
            )
        };

        if approved {
            state.user_counter(&user_id).add(USER_WINDOW, delta);
            state.site_counter.add(SITE_WINDOW, delta);
        }

        tracing::debug!(
            request_id = %request_id,
            actual_cost = %format!("${:.6}", actual_cost),
            delta = %format!("${:+.6}", delta),
            "Request reconciled"
        );
    }

    /// Drop expired ledger records and idle user counters. Called by the
    /// governor's maintenance task.
    pub fn sweep(&self) {
        let mut state = self.state.lock().expect("cost guardian mutex poisoned");
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.ledger_retention_secs as i64);
        let removed = state.ledger.sweep_older_than(cutoff);

        let before = state.user_counters.len();
        state.user_counters.retain(|_, c| !c.window_elapsed(USER_WINDOW));
        let idle = before - state.user_counters.len();

        if removed > 0 || idle > 0 {
            tracing::debug!(
                expired_records = removed,
                idle_counters = idle,
                "Guardian sweep completed"
            );
        }
    }

    pub fn user_snapshot(&self, user_id: &str) -> UserSpendSnapshot {
        let mut state = self.state.lock().expect("cost guardian mutex poisoned");
        let daily_max = self.config.user_daily_max_usd;
        let counter = state.user_counter(user_id);
        let spent = counter.current(USER_WINDOW);
        UserSpendSnapshot {
            user_id: user_id.to_string(),
            spent_today_usd: spent,
            remaining_today_usd: (daily_max - spent).max(0.0),
            window_resets_in: counter.window_remaining(USER_WINDOW),
        }
    }

    pub fn site_spent_this_hour(&self) -> f64 {
        let mut state = self.state.lock().expect("cost guardian mutex poisoned");
        state.site_counter.current(SITE_WINDOW)
    }

    pub fn ledger_len(&self) -> usize {
        let state = self.state.lock().expect("cost guardian mutex poisoned");
        state.ledger.len()
    }

    // -- Internals --

    fn record_locked(
        state: &mut GuardianState,
        request_id: &str,
        user_id: &str,
        estimated_cost: f64,
        approved: bool,
    ) {
        state.ledger.append(UsageRecord {
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            estimated_cost,
            actual_cost: None,
            approved,
            completed: false,
        });
        if approved {
            state.user_counter(user_id).add(USER_WINDOW, estimated_cost);
            state.site_counter.add(SITE_WINDOW, estimated_cost);
        }
    }

    /// Ceiling checks in fixed order: per-request, user daily, site hourly.
    /// All failures are enumerated, not just the first.
    fn decide(
        &self,
        state: &mut GuardianState,
        user_id: &str,
        capability: &CapabilityRecord,
        input_tokens: u64,
        target_output_tokens: u64,
        reasoning_tokens: u64,
    ) -> PreflightDecision {
        let estimated = estimate_cost(
            &capability.pricing,
            input_tokens,
            target_output_tokens,
            reasoning_tokens,
        );

        let mut failures = Vec::new();
        let mut suggestions = Vec::new();
        let mut recommended = None;
        let mut retry_after = None;

        if estimated > self.config.request_max_usd {
            failures.push(format!(
                "estimated cost ${estimated:.4} exceeds the per-request ceiling of ${:.2}",
                self.config.request_max_usd
            ));
            suggestions.push(
                "Request fewer output tokens or split the work into smaller requests".to_string(),
            );
            recommended = self.recommended_output_tokens(
                &capability.pricing,
                input_tokens,
                reasoning_tokens,
                target_output_tokens,
            );
        }

        let user_spent = state.user_counter(user_id).current(USER_WINDOW);
        if user_spent + estimated > self.config.user_daily_max_usd {
            failures.push(format!(
                "user '{user_id}' has spent ${user_spent:.4} in the current daily window; \
                 adding ${estimated:.4} would exceed the ${:.2} ceiling",
                self.config.user_daily_max_usd
            ));
            suggestions
                .push("Wait for your daily budget window to reset or send smaller requests".to_string());
            retry_after = Some(
                state
                    .user_counter(user_id)
                    .window_remaining(USER_WINDOW),
            );
        }

        let site_spent = state.site_counter.current(SITE_WINDOW);
        if site_spent + estimated > self.config.site_hourly_max_usd {
            failures.push(format!(
                "site-wide spending of ${site_spent:.4} this hour plus ${estimated:.4} \
                 would exceed the ${:.2} hourly ceiling",
                self.config.site_hourly_max_usd
            ));
            suggestions.push("Retry after the site-wide hourly window resets".to_string());
            // The earliest-cited window failure decides the suggested wait.
            if retry_after.is_none() {
                retry_after = Some(state.site_counter.window_remaining(SITE_WINDOW));
            }
        }

        let allowed = failures.is_empty();
        PreflightDecision {
            allowed,
            estimated_cost: estimated,
            reason: (!allowed).then(|| failures.join("; ")),
            recommended_output_tokens: recommended,
            suggestions,
            retry_after: if allowed { None } else { retry_after },
        }
    }

    /// Output size that keeps the request under the per-request ceiling after
    /// input and reasoning cost, floored at a minimum viable size. None when
    /// no smaller-but-viable output exists.
    fn recommended_output_tokens(
        &self,
        pricing: &Pricing,
        input_tokens: u64,
        reasoning_tokens: u64,
        requested_output: u64,
    ) -> Option<u32> {
        if pricing.output_per_1k <= 0.0 {
            return None;
        }
        let fixed = input_tokens as f64 / 1000.0 * pricing.input_per_1k
            + reasoning_tokens as f64 / 1000.0 * pricing.reasoning_per_1k;
        let room = self.config.request_max_usd - fixed;
        if room <= 0.0 {
            return None;
        }
        let fit = (room / pricing.output_per_1k * 1000.0).floor() as u64;
        let fit = fit.max(MIN_VIABLE_OUTPUT_TOKENS);
        (fit < requested_output).then_some(fit.min(u64::from(u32::MAX)) as u32)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Property-Based Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::capability::{Provenance, RateLimit};
    use proptest::prelude::*;

    fn capability() -> CapabilityRecord {
        CapabilityRecord {
            model_id: "prop-model".into(),
            context_window_tokens: 1_000_000,
            max_output_tokens_per_request: 500_000,
            supports_reasoning: true,
            rate_limit: RateLimit {
                requests_per_second: 10.0,
                tokens_per_minute: 100_000,
            },
            pricing: Pricing {
                input_per_1k: 0.003,
                output_per_1k: 0.015,
                reasoning_per_1k: 0.060,
            },
            last_updated_at: Utc::now(),
            provenance: Provenance::Fallback,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Cost is non-negative, finite, and monotonic in every token kind.
        #[test]
        fn prop_cost_well_behaved(
            input in 0u64..1_000_000,
            output in 0u64..1_000_000,
            reasoning in 0u64..1_000_000,
        ) {
            let pricing = capability().pricing;
            let cost = estimate_cost(&pricing, input, output, reasoning);
            prop_assert!(cost >= 0.0);
            prop_assert!(cost.is_finite());
            prop_assert!(estimate_cost(&pricing, input + 1000, output, reasoning) >= cost);
            prop_assert!(estimate_cost(&pricing, input, output + 1000, reasoning) >= cost);
            prop_assert!(estimate_cost(&pricing, input, output, reasoning + 1000) >= cost);
        }

        /// Repeated preflights with nothing recorded in between agree exactly
        /// and leave no trace in the ledger.
        #[test]
        fn prop_preflight_idempotent(
            input in 0i64..500_000,
            output in 0i64..500_000,
        ) {
            let guardian = CostGuardian::new(BudgetConfig::default());
            let cap = capability();

            let first = guardian.preflight("prop-user", &cap, input, output, 0).unwrap();
            let second = guardian.preflight("prop-user", &cap, input, output, 0).unwrap();

            prop_assert_eq!(first, second);
            prop_assert_eq!(guardian.ledger_len(), 0);
        }
    }
}
