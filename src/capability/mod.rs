//! Analysis capabilities and the concurrent invoker
//!
//! Each capability is an opaque function from a financial snapshot to a
//! list of findings. The set is a closed enum so the referral adjacency
//! map and the name/domain tables stay exhaustiveness-checked.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::claude::{strip_code_fences, ClaudeClient};
use crate::error::OrchestratorError;
use crate::models::{CapabilityResult, Finding};
use crate::ranker;
use crate::snapshot::FinancialSnapshot;
use crate::Result;

//
// ================= Capability identity =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "allocation")]
    Allocation,
    #[serde(rename = "tax_implications")]
    TaxImplications,
    #[serde(rename = "tlh")]
    LossHarvesting,
    #[serde(rename = "rate_arbitrage")]
    RateArbitrage,
    #[serde(rename = "timing")]
    Timing,
}

impl Capability {
    pub const fn all() -> &'static [Capability] {
        &[
            Capability::Allocation,
            Capability::TaxImplications,
            Capability::LossHarvesting,
            Capability::RateArbitrage,
            Capability::Timing,
        ]
    }

    pub const fn name(self) -> &'static str {
        match self {
            Capability::Allocation => "allocation",
            Capability::TaxImplications => "tax_implications",
            Capability::LossHarvesting => "tlh",
            Capability::RateArbitrage => "rate_arbitrage",
            Capability::Timing => "timing",
        }
    }

    /// Key used for this capability's findings in a findings map.
    pub const fn domain_key(self) -> &'static str {
        match self {
            Capability::Allocation => "allocation",
            Capability::TaxImplications => "tax",
            Capability::LossHarvesting => "tlh",
            Capability::RateArbitrage => "rates",
            Capability::Timing => "timing",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Capability::Allocation => {
                "TFSA/RRSP/FHSA contribution room, cash placement, registered account gaps"
            }
            Capability::TaxImplications => {
                "tax consequences of trades, capital gains, selling decisions"
            }
            Capability::LossHarvesting => {
                "tax-loss harvesting, unrealized losses, superficial loss rule"
            }
            Capability::RateArbitrage => {
                "margin interest vs cash rate, capital inefficiencies"
            }
            Capability::Timing => {
                "RRSP deadline, tax-year end, time-sensitive opportunities"
            }
        }
    }

    /// One-sentence status shown to the user while the capability runs.
    pub const fn handoff_message(self) -> &'static str {
        match self {
            Capability::Allocation => "Reviewing your contribution room and cash placement...",
            Capability::TaxImplications => "Analyzing the tax consequences of this trade...",
            Capability::LossHarvesting => "Scanning for tax-loss harvesting opportunities...",
            Capability::RateArbitrage => {
                "Comparing your margin rate against your cash position..."
            }
            Capability::Timing => "Checking for time-sensitive deadlines...",
        }
    }

    pub fn from_name(name: &str) -> Option<Capability> {
        match name {
            "allocation" => Some(Capability::Allocation),
            "tax_implications" => Some(Capability::TaxImplications),
            "tlh" => Some(Capability::LossHarvesting),
            "rate_arbitrage" => Some(Capability::RateArbitrage),
            "timing" => Some(Capability::Timing),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

//
// ================= Referral adjacency =================
//

/// A source that referrals can originate from: a capability that ran this
/// turn, or the sentinel for turns answered without invoking any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferralSource {
    Capability(Capability),
    DirectResponse,
}

impl ReferralSource {
    pub fn name(self) -> &'static str {
        match self {
            ReferralSource::Capability(c) => c.name(),
            ReferralSource::DirectResponse => "direct_response",
        }
    }

    /// Hand-curated follow-up candidates per source. The map is
    /// direction-sensitive: A suggesting B does not imply B suggests A.
    pub const fn referral_candidates(self) -> &'static [Capability] {
        match self {
            ReferralSource::Capability(Capability::Allocation) => {
                &[Capability::Timing, Capability::RateArbitrage]
            }
            ReferralSource::Capability(Capability::TaxImplications) => {
                &[Capability::LossHarvesting, Capability::Timing]
            }
            ReferralSource::Capability(Capability::LossHarvesting) => {
                &[Capability::TaxImplications, Capability::Timing]
            }
            ReferralSource::Capability(Capability::RateArbitrage) => &[Capability::Allocation],
            ReferralSource::Capability(Capability::Timing) => {
                &[Capability::Allocation, Capability::TaxImplications]
            }
            ReferralSource::DirectResponse => Capability::all(),
        }
    }
}

const REFERRAL_DEFAULT_HANDOFF: &str = "Let me see if any other analysis can add to this...";

/// Handoff line for an accepted referral, keyed by (source, target).
pub fn referral_handoff(sources: &[ReferralSource], target: Capability) -> &'static str {
    for source in sources {
        let msg = match (source, target) {
            (ReferralSource::Capability(Capability::Allocation), Capability::RateArbitrage) => {
                Some("Your cash position affects your rate picture too — checking that...")
            }
            (ReferralSource::Capability(Capability::Allocation), Capability::Timing) => {
                Some("Let me check if any deadlines apply to this...")
            }
            (
                ReferralSource::Capability(Capability::TaxImplications),
                Capability::LossHarvesting,
            ) => Some("There may be losses worth harvesting against this — looking now..."),
            (ReferralSource::Capability(Capability::TaxImplications), Capability::Timing) => {
                Some("Checking if there are any time-sensitive considerations here...")
            }
            (ReferralSource::Capability(Capability::LossHarvesting), Capability::Timing) => {
                Some("Let me check the timing angle on this harvest...")
            }
            (
                ReferralSource::Capability(Capability::LossHarvesting),
                Capability::TaxImplications,
            ) => Some("Reviewing the full tax picture on this..."),
            (ReferralSource::Capability(Capability::RateArbitrage), Capability::Allocation) => {
                Some("This changes your allocation calculus — checking contribution room...")
            }
            (ReferralSource::Capability(Capability::Timing), Capability::Allocation) => {
                Some("Your cash position matters here — reviewing allocation...")
            }
            (ReferralSource::Capability(Capability::Timing), Capability::TaxImplications) => {
                Some("Checking the tax angle on this timing...")
            }
            _ => None,
        };
        if let Some(msg) = msg {
            return msg;
        }
    }
    REFERRAL_DEFAULT_HANDOFF
}

//
// ================= Runner boundary =================
//

/// Opaque analysis function. Callers must hand every invocation its own
/// snapshot; implementations never share mutable state across calls.
#[async_trait]
pub trait CapabilityRunner: Send + Sync {
    async fn run(
        &self,
        capability: Capability,
        snapshot: &FinancialSnapshot,
        ruleset: &Value,
    ) -> Result<Vec<Finding>>;
}

/// LLM-backed runner: one Anthropic call per capability with a
/// capability-specific system prompt, expecting `{"findings": [...]}`.
pub struct LlmCapabilityRunner {
    client: Arc<ClaudeClient>,
}

impl LlmCapabilityRunner {
    pub fn new(client: Arc<ClaudeClient>) -> Self {
        Self { client }
    }

    fn system_prompt(capability: Capability) -> String {
        format!(
            "You are the {} analyst for a Canadian personal-finance assistant. \
             Your scope: {}. Analyze the financial snapshot and tax rules you are given \
             and return ONLY valid JSON of the form {{\"findings\": [...]}}. Each finding \
             must have exactly these fields: title, dollar_impact (number, CAD), \
             impact_direction (save|earn|avoid), urgency (immediate|this_month|evergreen), \
             reasoning, confidence (high|medium|low), what_to_do. \
             Return an empty findings list when nothing material applies.",
            capability.name(),
            capability.description(),
        )
    }
}

#[async_trait]
impl CapabilityRunner for LlmCapabilityRunner {
    async fn run(
        &self,
        capability: Capability,
        snapshot: &FinancialSnapshot,
        ruleset: &Value,
    ) -> Result<Vec<Finding>> {
        let user_content = serde_json::to_string(&serde_json::json!({
            "financial_profile": snapshot,
            "tax_rules": ruleset,
        }))?;

        let raw = self
            .client
            .complete(&Self::system_prompt(capability), &user_content, 2048)
            .await?;

        let parsed: Value = serde_json::from_str(strip_code_fences(&raw)).map_err(|e| {
            OrchestratorError::CapabilityError(format!(
                "{} returned malformed JSON: {}",
                capability, e
            ))
        })?;

        let raw_findings = parsed
            .get("findings")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(ranker::validate_findings(
            capability.domain_key(),
            &raw_findings,
        ))
    }
}

/// Canned runner for the demo binary and tests.
pub struct StaticCapabilityRunner {
    findings: HashMap<Capability, Vec<Finding>>,
}

impl StaticCapabilityRunner {
    pub fn new(findings: HashMap<Capability, Vec<Finding>>) -> Self {
        Self { findings }
    }

    pub fn empty() -> Self {
        Self {
            findings: HashMap::new(),
        }
    }
}

#[async_trait]
impl CapabilityRunner for StaticCapabilityRunner {
    async fn run(
        &self,
        capability: Capability,
        _snapshot: &FinancialSnapshot,
        _ruleset: &Value,
    ) -> Result<Vec<Finding>> {
        Ok(self.findings.get(&capability).cloned().unwrap_or_default())
    }
}

//
// ================= Group invocation =================
//

/// Outcome of one capability inside a fan-out. Failures are converted to an
/// empty result plus an error marker so siblings are never aborted.
#[derive(Debug, Clone)]
pub struct CapabilityOutcome {
    pub capability: Capability,
    pub findings: Vec<Finding>,
    pub error: Option<String>,
}

impl CapabilityOutcome {
    pub fn result(&self) -> CapabilityResult {
        CapabilityResult {
            capability: self.capability,
            findings: self.findings.clone(),
        }
    }
}

pub struct CapabilityInvoker {
    runner: Arc<dyn CapabilityRunner>,
}

impl CapabilityInvoker {
    pub fn new(runner: Arc<dyn CapabilityRunner>) -> Self {
        Self { runner }
    }

    pub async fn run_one(
        &self,
        capability: Capability,
        snapshot: &FinancialSnapshot,
        ruleset: &Value,
    ) -> Result<Vec<Finding>> {
        self.runner.run(capability, snapshot, ruleset).await
    }

    /// Run a group of capabilities concurrently. Each call gets its own
    /// copy of the snapshot; results come back in request order regardless
    /// of completion order.
    pub async fn run_group(
        &self,
        capabilities: &[Capability],
        snapshot: &FinancialSnapshot,
        ruleset: &Value,
    ) -> Vec<CapabilityOutcome> {
        let calls = capabilities.iter().map(|&capability| {
            let own_snapshot = snapshot.clone();
            let runner = Arc::clone(&self.runner);
            let own_ruleset = ruleset.clone();
            async move {
                match runner.run(capability, &own_snapshot, &own_ruleset).await {
                    Ok(findings) => CapabilityOutcome {
                        capability,
                        findings,
                        error: None,
                    },
                    Err(e) => {
                        error!(capability = %capability, "Capability failed: {}", e);
                        CapabilityOutcome {
                            capability,
                            findings: Vec::new(),
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        });

        join_all(calls).await
    }

    /// Bounded-time variant: the whole fan-out plus collection runs under a
    /// fixed deadline and degrades to "no findings" instead of blocking the
    /// caller. Used by the trade pre-check flow.
    pub async fn run_group_within(
        &self,
        deadline: Duration,
        capabilities: &[Capability],
        snapshot: &FinancialSnapshot,
        ruleset: &Value,
    ) -> Vec<CapabilityOutcome> {
        match tokio::time::timeout(deadline, self.run_group(capabilities, snapshot, ruleset)).await
        {
            Ok(outcomes) => outcomes,
            Err(_) => {
                warn!(
                    ?deadline,
                    "Capability group timed out; degrading to empty results"
                );
                Vec::new()
            }
        }
    }
}
