//! Cross-referral expansion
//!
//! After a response exists, decide whether exactly one more capability
//! should run before the turn ends. Candidates come from the static
//! adjacency map; each is checked concurrently for material new value.
//! The checks fail closed: an error or malformed answer means "no".

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::capability::{Capability, ReferralSource};
use crate::claude::{strip_code_fences, ClaudeClient};
use crate::models::{FindingsMap, TurnState};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ReferralVerdict {
    pub refer: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AcceptedReferral {
    pub capability: Capability,
    pub reason: String,
}

#[async_trait]
pub trait ReferralEvaluator: Send + Sync {
    /// Would invoking this candidate add material new value right now?
    async fn evaluate(
        &self,
        candidate: Capability,
        message: &str,
        response: &str,
        findings: &FindingsMap,
    ) -> Result<ReferralVerdict>;
}

/// Candidate set for this turn: the union of adjacency targets over every
/// source invoked so far, minus anything already invoked. Returned in
/// canonical capability order so downstream truncation is deterministic.
pub fn candidate_set(state: &TurnState) -> Vec<Capability> {
    let mut union: Vec<Capability> = Vec::new();
    for source in &state.invoked {
        for &candidate in source.referral_candidates() {
            if !state.has_invoked(candidate) && !union.contains(&candidate) {
                union.push(candidate);
            }
        }
    }
    Capability::all()
        .iter()
        .copied()
        .filter(|c| union.contains(c))
        .collect()
}

/// Evaluate every candidate concurrently and keep the accepted ones, in
/// candidate order, truncated to the remaining referral budget. The budget
/// truncation here is authoritative and independent of the adjacency
/// filtering.
pub async fn evaluate_candidates(
    evaluator: &Arc<dyn ReferralEvaluator>,
    state: &TurnState,
    message: &str,
    response: &str,
    findings: &FindingsMap,
) -> Vec<AcceptedReferral> {
    let candidates = candidate_set(state);
    if candidates.is_empty() || state.referral_budget_remaining == 0 {
        return Vec::new();
    }

    let checks = candidates.iter().map(|&candidate| {
        let evaluator = Arc::clone(evaluator);
        let message = message.to_string();
        let response = response.to_string();
        let findings = findings.clone();
        async move {
            match evaluator
                .evaluate(candidate, &message, &response, &findings)
                .await
            {
                Ok(verdict) => (candidate, verdict),
                Err(e) => {
                    // fail closed: this candidate is out, the turn goes on
                    error!(candidate = %candidate, "Referral check failed: {}", e);
                    (
                        candidate,
                        ReferralVerdict {
                            refer: false,
                            reason: String::new(),
                        },
                    )
                }
            }
        }
    });

    join_all(checks)
        .await
        .into_iter()
        .filter(|(_, verdict)| verdict.refer)
        .map(|(capability, verdict)| AcceptedReferral {
            capability,
            reason: verdict.reason,
        })
        .take(state.referral_budget_remaining as usize)
        .collect()
}

pub struct LlmReferralEvaluator {
    client: Arc<ClaudeClient>,
}

impl LlmReferralEvaluator {
    pub fn new(client: Arc<ClaudeClient>) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    refer: bool,
    #[serde(default)]
    reason: String,
}

#[async_trait]
impl ReferralEvaluator for LlmReferralEvaluator {
    async fn evaluate(
        &self,
        candidate: Capability,
        message: &str,
        response: &str,
        findings: &FindingsMap,
    ) -> Result<ReferralVerdict> {
        let system = format!(
            "Given the user's question, the findings shown, and the response already \
             given, would invoking the {} capability ({}) add meaningful NEW value for \
             the user right now? Only say yes if there is a clear, specific connection — \
             not on general principle. If findings are empty or the question is a \
             greeting/small-talk, always say no. \
             Return ONLY valid JSON: {{\"refer\": true/false, \"reason\": \"one sentence\"}}",
            candidate.name(),
            candidate.description(),
        );

        let user_content = serde_json::to_string(&json!({
            "user_message": message,
            "response": response,
            "agent_findings": findings,
        }))?;

        let raw = self.client.complete(&system, &user_content, 128).await?;
        let parsed: RawVerdict = serde_json::from_str(strip_code_fences(&raw))?;

        Ok(ReferralVerdict {
            refer: parsed.refer,
            reason: parsed.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;

    struct AcceptAll;

    #[async_trait]
    impl ReferralEvaluator for AcceptAll {
        async fn evaluate(
            &self,
            _candidate: Capability,
            _message: &str,
            _response: &str,
            _findings: &FindingsMap,
        ) -> Result<ReferralVerdict> {
            Ok(ReferralVerdict {
                refer: true,
                reason: "relevant".to_string(),
            })
        }
    }

    struct FailFor(Capability);

    #[async_trait]
    impl ReferralEvaluator for FailFor {
        async fn evaluate(
            &self,
            candidate: Capability,
            _message: &str,
            _response: &str,
            _findings: &FindingsMap,
        ) -> Result<ReferralVerdict> {
            if candidate == self.0 {
                Err(OrchestratorError::LlmError("timeout".to_string()))
            } else {
                Ok(ReferralVerdict {
                    refer: true,
                    reason: "relevant".to_string(),
                })
            }
        }
    }

    fn state_with(sources: &[ReferralSource], budget: u32) -> TurnState {
        let mut state = TurnState::new(budget);
        for &source in sources {
            state.record(source);
        }
        state
    }

    #[test]
    fn test_candidates_exclude_already_invoked() {
        // tax_implications suggests tlh and timing; tlh already ran
        let state = state_with(
            &[
                ReferralSource::Capability(Capability::TaxImplications),
                ReferralSource::Capability(Capability::LossHarvesting),
            ],
            1,
        );
        let candidates = candidate_set(&state);
        assert!(!candidates.contains(&Capability::TaxImplications));
        assert!(!candidates.contains(&Capability::LossHarvesting));
        assert!(candidates.contains(&Capability::Timing));
    }

    #[test]
    fn test_direct_response_sentinel_yields_full_set() {
        let state = state_with(&[ReferralSource::DirectResponse], 1);
        let candidates = candidate_set(&state);
        assert_eq!(candidates.len(), Capability::all().len());
    }

    #[tokio::test]
    async fn test_budget_bounds_accepted_referrals() {
        let evaluator: Arc<dyn ReferralEvaluator> = Arc::new(AcceptAll);
        let state = state_with(&[ReferralSource::DirectResponse], 1);
        let accepted = evaluate_candidates(
            &evaluator,
            &state,
            "question",
            "answer",
            &FindingsMap::new(),
        )
        .await;
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_short_circuits() {
        let evaluator: Arc<dyn ReferralEvaluator> = Arc::new(AcceptAll);
        let state = state_with(&[ReferralSource::DirectResponse], 0);
        let accepted = evaluate_candidates(
            &evaluator,
            &state,
            "question",
            "answer",
            &FindingsMap::new(),
        )
        .await;
        assert!(accepted.is_empty());
    }

    #[tokio::test]
    async fn test_failed_check_excludes_candidate_only() {
        // allocation's candidates are timing and rate_arbitrage; the
        // evaluator dies on timing but still accepts rate_arbitrage
        let evaluator: Arc<dyn ReferralEvaluator> = Arc::new(FailFor(Capability::Timing));
        let state = state_with(&[ReferralSource::Capability(Capability::Allocation)], 2);
        let accepted = evaluate_candidates(
            &evaluator,
            &state,
            "question",
            "answer",
            &FindingsMap::new(),
        )
        .await;
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].capability, Capability::RateArbitrage);
    }
}
