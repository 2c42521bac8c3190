//! WealthMind Orchestrator
//!
//! A conversational financial analysis backend:
//! - Routes each user message to specialized analysis capabilities
//! - Invokes the selected capabilities concurrently against an immutable
//!   financial snapshot
//! - Merges, dedupes and ranks their findings deterministically
//! - Runs one budget-limited cross-referral after the answer is produced
//! - Streams the whole multi-stage turn to the client as ordered events
//!
//! TURN LOOP:
//! ROUTE → (CONTEXT LOOKUP)? → ANSWER → REFER → FOLLOW-UPS → PERSIST

pub mod advisor;
pub mod api;
pub mod capability;
pub mod claude;
pub mod error;
pub mod intercept;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;
pub mod ranker;
pub mod referral;
pub mod router;
pub mod search;
pub mod session;
pub mod snapshot;
pub mod synthesizer;
pub mod whatif;

pub use error::Result;

// Re-export common types
pub use capability::{Capability, CapabilityInvoker, ReferralSource};
pub use models::{Finding, RoutingDecision, TurnState};
pub use orchestrator::TurnOrchestrator;
pub use protocol::{EventSender, TurnEvent};
