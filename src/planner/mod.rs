//! Token budget planning: fit the conversation and the output grant into the
//! model's context window before any money is spent.

use serde::Serialize;

use crate::capability::CapabilityRecord;
use crate::config::PlannerConfig;
use crate::types::{Message, Role, is_length_limited};

pub mod estimate;

// ---------------------------------------------------------------------------
// Plan type
// ---------------------------------------------------------------------------

/// Outcome of budget planning for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetPlan {
    /// Estimated tokens for the input conversation.
    pub input_tokens: u32,
    /// Output tokens this call may produce.
    pub granted_output_tokens: u32,
    /// Context left for output after input and safety margin.
    pub remaining_context: u32,
    /// Input plus grant plus margin exceeds the window; history must shrink.
    pub needs_truncation: bool,
    /// Set post-response when the answer looks cut off (see
    /// [`TokenPlanner::continuation_advised`]).
    pub continuation_advised: bool,
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TokenPlanner {
    config: PlannerConfig,
}

impl TokenPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Derive the token budget for a conversation against a model's limits.
    ///
    /// The grant is the largest output that fits the remaining window, capped
    /// by the model's per-request output limit and the caller's requested
    /// maximum, and floored at the configured minimum output guarantee. When
    /// even the floored grant does not fit, `needs_truncation` is set.
    pub fn plan(
        &self,
        capability: &CapabilityRecord,
        messages: &[Message],
        requested_max_tokens: Option<u32>,
    ) -> BudgetPlan {
        let input_tokens = estimate::estimate_messages(messages);
        let context = capability.context_window_tokens;
        let margin = self.config.safety_margin_tokens;

        let available = context
            .saturating_sub(input_tokens)
            .saturating_sub(margin);

        let granted = available
            .min(capability.max_output_tokens_per_request)
            .min(requested_max_tokens.unwrap_or(u32::MAX))
            .max(self.config.min_output_tokens);

        let needs_truncation =
            input_tokens as u64 + granted as u64 + margin as u64 > context as u64;

        BudgetPlan {
            input_tokens,
            granted_output_tokens: granted,
            remaining_context: available,
            needs_truncation,
            continuation_advised: false,
        }
    }

    /// Shrink the history until the plan fits, then re-plan.
    ///
    /// Drops the oldest user/assistant pair ahead of everything else that can
    /// go: leading system messages are kept, and the most recent message is
    /// never dropped. When nothing droppable remains the last plan is
    /// returned with `needs_truncation` still set.
    pub fn truncate_to_fit(
        &self,
        capability: &CapabilityRecord,
        mut messages: Vec<Message>,
        requested_max_tokens: Option<u32>,
    ) -> (Vec<Message>, BudgetPlan) {
        let mut plan = self.plan(capability, &messages, requested_max_tokens);
        if !plan.needs_truncation {
            return (messages, plan);
        }

        let system_prefix = messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count();

        while plan.needs_truncation {
            let droppable = messages.len().saturating_sub(system_prefix + 1);
            if droppable == 0 {
                break;
            }
            // Whole pairs where possible; a lone leftover goes on its own.
            let drop_count = droppable.min(2);
            messages.drain(system_prefix..system_prefix + drop_count);
            plan = self.plan(capability, &messages, requested_max_tokens);
        }

        if plan.needs_truncation {
            tracing::warn!(
                input_tokens = plan.input_tokens,
                context_window = capability.context_window_tokens,
                "Conversation still exceeds the context window after truncation"
            );
        }

        (messages, plan)
    }

    /// Whether a finished response looks cut off and worth continuing.
    ///
    /// Heuristic: a length-limited finish reason whose body already reached
    /// the minimum output guarantee counts as an interrupted answer. This is
    /// an approximation and deliberately consults nothing else; short bodies
    /// under the guarantee are treated as genuinely done.
    pub fn continuation_advised(&self, finish_reason: Option<&str>, content: &str) -> bool {
        is_length_limited(finish_reason)
            && estimate::estimate_text(content) >= self.config.min_output_tokens
    }

    /// Build the user directive that asks the model to resume an interrupted
    /// answer, tagged with its position in the segment sequence.
    pub fn continuation_directive(
        &self,
        segment_index: u32,
        estimated_total_segments: u32,
    ) -> Message {
        Message::user(format!(
            "Continue your previous answer from exactly where it stopped. \
             Do not repeat earlier content. \
             [continuation segment {segment_index} of ~{estimated_total_segments}]"
        ))
    }

    pub fn max_continuation_segments(&self) -> u32 {
        self.config.max_continuation_segments
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Pricing, Provenance, RateLimit};
    use chrono::Utc;

    fn capability(context: u32, max_output: u32) -> CapabilityRecord {
        CapabilityRecord {
            model_id: "demo-chat".into(),
            context_window_tokens: context,
            max_output_tokens_per_request: max_output,
            supports_reasoning: false,
            rate_limit: RateLimit {
                requests_per_second: 10.0,
                tokens_per_minute: 100_000,
            },
            pricing: Pricing {
                input_per_1k: 0.001,
                output_per_1k: 0.002,
                reasoning_per_1k: 0.0,
            },
            last_updated_at: Utc::now(),
            provenance: Provenance::Fallback,
        }
    }

    fn planner(margin: u32, min_output: u32) -> TokenPlanner {
        TokenPlanner::new(PlannerConfig {
            safety_margin_tokens: margin,
            min_output_tokens: min_output,
            max_continuation_segments: 3,
        })
    }

    #[test]
    fn test_grant_is_exactly_the_remaining_window() {
        // 3384 chars -> 846 tokens, plus 4 framing -> input of 850.
        let messages = vec![Message::user("x".repeat(3384))];
        let plan = planner(0, 32).plan(&capability(1000, 200), &messages, None);

        assert_eq!(plan.input_tokens, 850);
        assert_eq!(plan.granted_output_tokens, 150);
        assert_eq!(plan.remaining_context, 150);
        assert!(!plan.needs_truncation);
        assert!(!plan.continuation_advised);
    }

    #[test]
    fn test_model_output_cap_limits_grant() {
        let messages = vec![Message::user("x".repeat(400))]; // 104 tokens
        let plan = planner(0, 32).plan(&capability(10_000, 200), &messages, None);
        assert_eq!(plan.granted_output_tokens, 200);
    }

    #[test]
    fn test_requested_max_limits_grant() {
        let messages = vec![Message::user("x".repeat(400))];
        let plan = planner(0, 32).plan(&capability(10_000, 2_000), &messages, Some(50));
        assert_eq!(plan.granted_output_tokens, 50);
    }

    #[test]
    fn test_safety_margin_reduces_available() {
        let messages = vec![Message::user("x".repeat(3384))]; // 850 tokens
        let plan = planner(100, 32).plan(&capability(1000, 200), &messages, None);
        assert_eq!(plan.remaining_context, 50);
        assert_eq!(plan.granted_output_tokens, 50);
    }

    #[test]
    fn test_grant_floored_at_minimum_and_flags_truncation() {
        let messages = vec![Message::user("x".repeat(3384))]; // 850 tokens
        let plan = planner(0, 64).plan(&capability(880, 200), &messages, None);
        // Only 30 tokens fit, but the guarantee holds the grant at 64.
        assert_eq!(plan.granted_output_tokens, 64);
        assert!(plan.needs_truncation);
    }

    #[test]
    fn test_truncation_drops_oldest_pairs_keeps_system_and_latest() {
        let mut messages = vec![Message::system("You are terse.")];
        for i in 0..3 {
            messages.push(Message::user("q".repeat(60)));
            messages.push(Message::assistant(format!("answer {i}: {}", "a".repeat(50))));
        }
        messages.push(Message::user("tail"));

        let planner = planner(0, 10);
        let cap = capability(100, 50);
        let before = planner.plan(&cap, &messages, None);
        assert!(before.needs_truncation);

        let (kept, plan) = planner.truncate_to_fit(&cap, messages, None);

        assert!(!plan.needs_truncation);
        assert_eq!(kept[0].role, Role::System);
        assert_eq!(kept.last().unwrap().content, "tail");
        // Pairs went together: what remains is system + an even-sized tail
        // of the conversation plus the latest message.
        assert!(kept.len() < 8);
    }

    #[test]
    fn test_truncation_never_drops_most_recent_message() {
        let messages = vec![
            Message::system("sys"),
            Message::user("x".repeat(2000)), // far beyond the window alone
        ];
        let planner = planner(0, 10);
        let (kept, plan) = planner.truncate_to_fit(&capability(50, 20), messages, None);

        assert_eq!(kept.len(), 2);
        assert!(plan.needs_truncation);
    }

    #[test]
    fn test_continuation_advised_requires_both_signals() {
        let planner = planner(0, 32);
        let long_body = "word ".repeat(100); // ~125 tokens

        assert!(planner.continuation_advised(Some("length"), &long_body));
        assert!(planner.continuation_advised(Some("max_tokens"), &long_body));
        // Natural stop: not advised, however long the body.
        assert!(!planner.continuation_advised(Some("stop"), &long_body));
        // Too little content to bother resuming.
        assert!(!planner.continuation_advised(Some("length"), "short"));
        assert!(!planner.continuation_advised(None, &long_body));
    }

    #[test]
    fn test_continuation_directive_tags_segments() {
        let directive = planner(0, 32).continuation_directive(2, 4);
        assert_eq!(directive.role, Role::User);
        assert!(directive.content.contains("segment 2 of ~4"));
        assert!(directive.content.to_lowercase().contains("continue"));
    }
}

// ---------------------------------------------------------------------------
// Property-Based Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::capability::{Pricing, Provenance, RateLimit};
    use chrono::Utc;
    use proptest::prelude::*;

    fn capability(context: u32, max_output: u32) -> CapabilityRecord {
        CapabilityRecord {
            model_id: "prop-model".into(),
            context_window_tokens: context,
            max_output_tokens_per_request: max_output.min(context),
            supports_reasoning: false,
            rate_limit: RateLimit {
                requests_per_second: 10.0,
                tokens_per_minute: 100_000,
            },
            pricing: Pricing {
                input_per_1k: 0.001,
                output_per_1k: 0.002,
                reasoning_per_1k: 0.0,
            },
            last_updated_at: Utc::now(),
            provenance: Provenance::Fallback,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The grant always honors the minimum guarantee, never exceeds the
        /// model cap (unless the guarantee itself does), and fits the window
        /// whenever truncation is not flagged.
        #[test]
        fn prop_plan_invariants(
            context in 64u32..32_768,
            max_output in 1u32..16_384,
            margin in 0u32..512,
            min_output in 1u32..256,
            text_len in 0usize..20_000,
        ) {
            let planner = TokenPlanner::new(PlannerConfig {
                safety_margin_tokens: margin,
                min_output_tokens: min_output,
                max_continuation_segments: 3,
            });
            let cap = capability(context, max_output);
            let messages = vec![Message::user("a".repeat(text_len))];

            let plan = planner.plan(&cap, &messages, None);

            prop_assert!(plan.granted_output_tokens >= min_output);
            prop_assert!(
                plan.granted_output_tokens
                    <= cap.max_output_tokens_per_request.max(min_output)
            );
            if !plan.needs_truncation {
                prop_assert!(
                    plan.input_tokens as u64
                        + plan.granted_output_tokens as u64
                        + margin as u64
                        <= context as u64
                );
            }
        }

        /// A requested maximum is a hard cap on the grant whenever it is at
        /// least the minimum guarantee.
        #[test]
        fn prop_requested_max_respected(
            requested in 1u32..10_000,
            text_len in 0usize..4_000,
        ) {
            let planner = TokenPlanner::new(PlannerConfig {
                safety_margin_tokens: 0,
                min_output_tokens: 1,
                max_continuation_segments: 3,
            });
            let cap = capability(100_000, 50_000);
            let messages = vec![Message::user("a".repeat(text_len))];

            let plan = planner.plan(&cap, &messages, Some(requested));
            prop_assert!(plan.granted_output_tokens <= requested);
        }
    }
}
