//! Top-level request governor.
//!
//! One [`Governor`] owns the capability registry, the token planner, the
//! cost guardian and the resilient client, and runs every inbound request
//! through them in a fixed order: validate, plan (truncating if needed),
//! admit against the budget ceilings, dispatch, reconcile. Budget denials
//! come back as a typed [`CallOutcome`], never as an error.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::capability::{CapabilityProbe, CapabilityRecord, CapabilityRegistry, HttpProbe};
use crate::client::{
    ApiError, CacheStats, CallOptions, CallPhase, EventStream, HttpTransport, ResilientClient,
    Transport,
};
use crate::config::Config;
use crate::error::GovernorError;
use crate::guardian::{CostGuardian, PreflightDecision, UserSpendSnapshot};
use crate::metrics::{MetricsSink, TracingMetrics};
use crate::planner::{BudgetPlan, TokenPlanner};
use crate::types::{ChatRequest, ChatResponse, Message, StreamEvent, Usage};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a buffered call that passed validation.
#[derive(Debug)]
pub enum CallOutcome {
    Completed(ChatResponse),
    /// The budget guard refused the call. Carries the reason, a fitting
    /// output size where one exists, and a wait hint for window denials.
    Denied(PreflightDecision),
}

/// Result of a streaming call that passed validation.
pub enum StreamOutcome {
    Stream(EventStream),
    Denied(PreflightDecision),
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

pub struct Governor {
    config: Config,
    registry: CapabilityRegistry,
    planner: TokenPlanner,
    guardian: CostGuardian,
    client: ResilientClient,
    maintenance: Vec<JoinHandle<()>>,
}

impl Governor {
    /// Build a governor against a live HTTP provider.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let probe: Arc<dyn CapabilityProbe> = Arc::new(HttpProbe::new(
            &config.provider,
            config.capability.probe_timeout(),
        )?);
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.provider)?);
        Ok(Self::from_parts(
            config,
            probe,
            transport,
            Arc::new(TracingMetrics),
        ))
    }

    /// Assemble from explicit parts. The seam for in-memory transports and
    /// probes in tests.
    pub fn from_parts(
        config: Config,
        probe: Arc<dyn CapabilityProbe>,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let registry = CapabilityRegistry::new(config.capability.clone(), probe);
        let planner = TokenPlanner::new(config.planner.clone());
        let guardian = CostGuardian::new(config.budget.clone());
        let client = ResilientClient::new(&config.client, transport, metrics);
        let maintenance = Self::spawn_maintenance(&config, &guardian, &client);
        Self {
            config,
            registry,
            planner,
            guardian,
            client,
            maintenance,
        }
    }

    /// Recurring sweepers for the ledger and the response cache. Outside a
    /// runtime nothing is spawned and sweeping falls to the caller.
    fn spawn_maintenance(
        config: &Config,
        guardian: &CostGuardian,
        client: &ResilientClient,
    ) -> Vec<JoinHandle<()>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Vec::new();
        }
        let period = config.budget.sweep_interval();

        let ledger_guardian = guardian.clone();
        let ledger_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                ledger_guardian.sweep();
            }
        });

        let cache_client = client.clone();
        let cache_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache_client.sweep_cache();
            }
        });

        vec![ledger_task, cache_task]
    }

    /// Stop the maintenance tasks. Dropping the governor does the same.
    pub fn shutdown(&self) {
        for task in &self.maintenance {
            task.abort();
        }
    }

    /// Pre-fill capability records for the given models before traffic
    /// arrives.
    pub async fn warmup(&self, model_ids: &[String]) {
        self.registry.warmup(model_ids).await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn user_snapshot(&self, user_id: &str) -> UserSpendSnapshot {
        self.guardian.user_snapshot(user_id)
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.client.cache_stats()
    }

    // -----------------------------------------------------------------------
    // Request pipeline
    // -----------------------------------------------------------------------

    fn validate(&self, request: &ChatRequest) -> Result<Vec<Message>, GovernorError> {
        if request.model.trim().is_empty() {
            return Err(GovernorError::InvalidRequest(
                "model must not be empty".to_string(),
            ));
        }
        let messages = request.resolve_messages();
        if messages.is_empty() {
            return Err(GovernorError::InvalidRequest(
                "request carries no prompt or messages".to_string(),
            ));
        }
        if let Some(max_tokens) = request.max_tokens {
            if max_tokens < 0 {
                return Err(GovernorError::InvalidRequest(format!(
                    "max_tokens must be non-negative, got {max_tokens}"
                )));
            }
        }
        if let Some(temperature) = request.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(GovernorError::InvalidRequest(format!(
                    "temperature must be within 0.0..=2.0, got {temperature}"
                )));
            }
        }
        Ok(messages)
    }

    fn admit(
        &self,
        request_id: &str,
        user_id: &str,
        capability: &CapabilityRecord,
        plan: &BudgetPlan,
    ) -> Result<PreflightDecision, GovernorError> {
        // Reasoning models spend their grant on thinking too; estimate the
        // worst case of a grant consumed entirely at both rates.
        let reasoning = if capability.supports_reasoning {
            i64::from(plan.granted_output_tokens)
        } else {
            0
        };
        self.guardian.admit(
            request_id,
            user_id,
            capability,
            i64::from(plan.input_tokens),
            i64::from(plan.granted_output_tokens),
            reasoning,
        )
    }

    /// Run one buffered request end to end. When the answer comes back
    /// length-limited the governor asks the model to continue, up to the
    /// configured number of follow-up segments, and returns the
    /// concatenation.
    pub async fn call(&self, request: ChatRequest) -> Result<CallOutcome, GovernorError> {
        let messages = self.validate(&request)?;
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let capability = self.registry.get(&request.model);
        let requested_max = request
            .max_tokens
            .map(|t| u32::try_from(t).unwrap_or(u32::MAX));

        let (messages, plan) = self
            .planner
            .truncate_to_fit(&capability, messages, requested_max);
        if plan.needs_truncation {
            return Err(GovernorError::InvalidRequest(
                "conversation does not fit the model's context window even after truncation"
                    .to_string(),
            ));
        }

        let budget_active = request.budget_guard_enabled && self.config.budget.enabled;
        if budget_active {
            let decision = self.admit(&request_id, &request.user_id, &capability, &plan)?;
            if !decision.allowed {
                return Ok(CallOutcome::Denied(decision));
            }
        }

        let mut options = CallOptions {
            temperature: request.temperature,
            max_tokens: Some(plan.granted_output_tokens),
            ..CallOptions::default()
        };

        let executed = match self.client.execute(&capability, messages.clone(), &options).await {
            Ok(executed) => executed,
            Err(e) => {
                if budget_active {
                    // Provider failure: hand the optimistic debit back.
                    self.guardian
                        .reconcile(&request_id, &Usage::default(), &capability);
                }
                return Err(e.into());
            }
        };
        if budget_active {
            // Cache hits settle to zero: nothing was spent upstream.
            self.guardian
                .reconcile(&request_id, &executed.billable_usage(), &capability);
        }
        let mut response = executed.response;

        // Follow-up segments while the answer looks cut off.
        let mut conversation = messages;
        let mut last_finish = response.finish_reason.clone();
        let mut last_content = response.content.clone();
        let mut continuations = 0u32;
        options.phase = CallPhase::Continuation;

        while continuations < self.planner.max_continuation_segments()
            && self
                .planner
                .continuation_advised(last_finish.as_deref(), &last_content)
        {
            continuations += 1;
            conversation.push(Message::assistant(last_content.clone()));
            conversation.push(
                self.planner
                    .continuation_directive(continuations, self.planner.max_continuation_segments()),
            );

            let (trimmed, seg_plan) =
                self.planner
                    .truncate_to_fit(&capability, conversation.clone(), requested_max);
            if seg_plan.needs_truncation {
                break;
            }

            let segment_id = format!("{request_id}/continuation-{continuations}");
            if budget_active {
                let decision =
                    self.admit(&segment_id, &request.user_id, &capability, &seg_plan)?;
                if !decision.allowed {
                    tracing::info!(
                        request_id = %request_id,
                        segment = continuations,
                        "Continuation denied by budget guard, returning partial answer"
                    );
                    break;
                }
            }
            options.max_tokens = Some(seg_plan.granted_output_tokens);

            match self.client.execute(&capability, trimmed, &options).await {
                Ok(executed) => {
                    if budget_active {
                        self.guardian
                            .reconcile(&segment_id, &executed.billable_usage(), &capability);
                    }
                    let segment = executed.response;
                    response.content.push_str(&segment.content);
                    response.usage += &segment.usage;
                    response.finish_reason = segment.finish_reason.clone();
                    last_finish = segment.finish_reason;
                    last_content = segment.content;
                }
                Err(e) => {
                    if budget_active {
                        self.guardian
                            .reconcile(&segment_id, &Usage::default(), &capability);
                    }
                    tracing::warn!(
                        request_id = %request_id,
                        segment = continuations,
                        error = %e,
                        "Continuation segment failed, returning partial answer"
                    );
                    break;
                }
            }
        }

        Ok(CallOutcome::Completed(response))
    }

    /// Run one streaming request. The returned stream reconciles the
    /// optimistic debit against provider-reported usage when it finishes,
    /// and on drop if the caller abandons it early. Continuation is a
    /// buffered-path feature; streams end where the provider ends them.
    pub async fn call_stream(&self, request: ChatRequest) -> Result<StreamOutcome, GovernorError> {
        let messages = self.validate(&request)?;
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let capability = self.registry.get(&request.model);
        let requested_max = request
            .max_tokens
            .map(|t| u32::try_from(t).unwrap_or(u32::MAX));

        let (messages, plan) = self
            .planner
            .truncate_to_fit(&capability, messages, requested_max);
        if plan.needs_truncation {
            return Err(GovernorError::InvalidRequest(
                "conversation does not fit the model's context window even after truncation"
                    .to_string(),
            ));
        }

        let budget_active = request.budget_guard_enabled && self.config.budget.enabled;
        if budget_active {
            let decision = self.admit(&request_id, &request.user_id, &capability, &plan)?;
            if !decision.allowed {
                return Ok(StreamOutcome::Denied(decision));
            }
        }

        let options = CallOptions {
            temperature: request.temperature,
            max_tokens: Some(plan.granted_output_tokens),
            ..CallOptions::default()
        };

        match self.client.stream(&capability, messages, &options).await {
            Ok(stream) => {
                let stream = if budget_active {
                    ReconcilingStream::wrap(
                        stream,
                        self.guardian.clone(),
                        capability,
                        request_id,
                    )
                } else {
                    stream
                };
                Ok(StreamOutcome::Stream(stream))
            }
            Err(e) => {
                if budget_active {
                    self.guardian
                        .reconcile(&request_id, &Usage::default(), &capability);
                }
                Err(e.into())
            }
        }
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Stream settlement
// ---------------------------------------------------------------------------

/// Passes events through while accumulating usage reports, and settles the
/// ledger exactly once: on the final event, on an in-band error, or on drop
/// when the consumer walks away mid-stream.
struct ReconcilingStream {
    inner: EventStream,
    guardian: CostGuardian,
    capability: CapabilityRecord,
    request_id: String,
    usage: Usage,
    settled: bool,
}

impl ReconcilingStream {
    fn wrap(
        inner: EventStream,
        guardian: CostGuardian,
        capability: CapabilityRecord,
        request_id: String,
    ) -> EventStream {
        Self {
            inner,
            guardian,
            capability,
            request_id,
            usage: Usage::default(),
            settled: false,
        }
        .boxed()
    }

    fn settle(&mut self) {
        if !self.settled {
            self.settled = true;
            self.guardian
                .reconcile(&self.request_id, &self.usage, &self.capability);
        }
    }
}

impl Stream for ReconcilingStream {
    type Item = Result<StreamEvent, ApiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                if let Some(usage) = event.usage {
                    this.usage.absorb(&usage);
                }
                if event.is_final() {
                    this.settle();
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.settle();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.settle();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ReconcilingStream {
    fn drop(&mut self) {
        self.settle();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
