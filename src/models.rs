//! Core data models for the analysis backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::capability::{Capability, ReferralSource};

/// Findings keyed by producing domain (allocation, tax, tlh, rates, timing)
pub type FindingsMap = HashMap<String, Vec<Finding>>;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImpactDirection {
    Save,
    Earn,
    Avoid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Immediate,
    ThisMonth,
    Evergreen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

//
// ================= Finding =================
//

/// One structured insight produced by a capability.
///
/// A finding is valid only when all seven required fields are present and
/// `dollar_impact` is numeric; anything else is dropped at the merge
/// boundary and never surfaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub title: String,
    pub dollar_impact: f64,
    pub impact_direction: ImpactDirection,
    pub urgency: Urgency,
    pub reasoning: String,
    pub confidence: Confidence,
    pub what_to_do: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(
        default,
        rename = "_source",
        skip_serializing_if = "Option::is_none"
    )]
    pub source: Option<String>,
}

impl Finding {
    /// Parse a raw JSON object into a valid finding, or `None` when the
    /// validity invariant does not hold.
    pub fn from_value(value: &Value) -> Option<Finding> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Case-insensitive, whitespace-trimmed identity key used for dedup.
    pub fn title_key(&self) -> String {
        self.title.trim().to_lowercase()
    }
}

/// Findings from exactly one capability invocation.
#[derive(Debug, Clone)]
pub struct CapabilityResult {
    pub capability: Capability,
    pub findings: Vec<Finding>,
}

//
// ================= Routing =================
//

/// Produced once per turn by the router; never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub capabilities_to_invoke: Vec<Capability>,
    pub needs_context_lookup: bool,
    pub context_query: Option<String>,
    pub can_answer_from_context: bool,
    pub direct_response: Option<String>,
    pub reasoning: String,
}

impl RoutingDecision {
    /// Fail-open default: invoke every known capability so the turn still
    /// produces a substantive answer.
    pub fn fallback(reason: &str) -> Self {
        Self {
            capabilities_to_invoke: Capability::all().to_vec(),
            needs_context_lookup: false,
            context_query: None,
            can_answer_from_context: false,
            direct_response: None,
            reasoning: format!("fallback: {}", reason),
        }
    }
}

//
// ================= Turn state =================
//

/// Ephemeral per-message bookkeeping. `invoked` only ever grows and doubles
/// as the cycle guard for referrals; the budget is decremented only when a
/// referral is actually accepted. Destroyed at end of turn.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub invoked: HashSet<ReferralSource>,
    pub referral_budget_remaining: u32,
}

impl TurnState {
    pub fn new(referral_budget: u32) -> Self {
        Self {
            invoked: HashSet::new(),
            referral_budget_remaining: referral_budget,
        }
    }

    pub fn record(&mut self, source: ReferralSource) {
        self.invoked.insert(source);
    }

    pub fn has_invoked(&self, capability: Capability) -> bool {
        self.invoked.contains(&ReferralSource::Capability(capability))
    }
}

//
// ================= Transcript =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agent_sources: Vec<String>,
    #[serde(default)]
    pub findings_snapshot: FindingsMap,
}

impl MessageRecord {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            agent_sources: Vec::new(),
            findings_snapshot: FindingsMap::new(),
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        agent_sources: Vec<String>,
        findings_snapshot: FindingsMap,
    ) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            agent_sources,
            findings_snapshot,
        }
    }
}

//
// ================= Context citations =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

//
// ================= What-if deltas =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeltaDirection {
    Improved,
    Worsened,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeltaPresence {
    Both,
    BaselineOnly,
    ModifiedOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingDelta {
    pub title: String,
    pub baseline_dollar_impact: f64,
    pub modified_dollar_impact: f64,
    pub delta_dollar_impact: f64,
    pub delta_pct: f64,
    pub direction: DeltaDirection,
    pub present_in: DeltaPresence,
}

impl fmt::Display for ImpactDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImpactDirection::Save => "save",
            ImpactDirection::Earn => "earn",
            ImpactDirection::Avoid => "avoid",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Urgency::Immediate => "immediate",
            Urgency::ThisMonth => "this_month",
            Urgency::Evergreen => "evergreen",
        };
        write!(f, "{}", s)
    }
}
