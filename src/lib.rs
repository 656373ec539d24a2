//! Request governor for LLM providers: capability discovery, token budget
//! planning, spend ceilings with optimistic debit/reconcile, and a resilient
//! provider client (cache, admission queue, retry, phase-aware timeouts).
//!
//! The [`Governor`] is the entry point; everything underneath is usable on
//! its own.

pub mod capability;
pub mod client;
pub mod config;
pub mod error;
pub mod governor;
pub mod guardian;
pub mod metrics;
pub mod planner;
pub mod types;

pub use crate::capability::{CapabilityRecord, CapabilityRegistry, Provenance};
pub use crate::client::{ApiError, CallOptions, ExecutedCall, Priority, ResilientClient};
pub use crate::config::Config;
pub use crate::error::GovernorError;
pub use crate::governor::{CallOutcome, Governor, StreamOutcome};
pub use crate::guardian::{CostGuardian, PreflightDecision, UserSpendSnapshot};
pub use crate::planner::{BudgetPlan, TokenPlanner};
pub use crate::types::{ChatRequest, ChatResponse, Message, Role, StreamEvent, Usage};
