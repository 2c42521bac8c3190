//! Turn routing
//!
//! Classifies a user message into the capabilities to invoke, whether an
//! external context lookup is needed, and optionally a direct answer from
//! context. High-confidence messages are routed deterministically by
//! keyword intent before any model call; everything else goes to the LLM.
//! Failure policy: fail open to "invoke everything".

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

use crate::capability::Capability;
use crate::claude::{strip_code_fences, ClaudeClient};
use crate::models::{FindingsMap, MessageRecord, RoutingDecision};
use crate::Result;

const HISTORY_WINDOW: usize = 6;

const ROUTER_SYSTEM_PROMPT: &str = "\
You route questions for a Canadian personal-finance assistant to analysis \
capabilities. The capabilities are: allocation (contribution room, cash \
placement), tax_implications (tax consequences of trades), tlh (tax-loss \
harvesting), rate_arbitrage (margin interest vs cash), timing (deadlines). \
Given the user message, recent conversation and a summary of prior \
findings, return ONLY valid JSON: {\"capabilities_to_invoke\": [...], \
\"needs_context_lookup\": bool, \"context_query\": string|null, \
\"can_answer_from_context\": bool, \"direct_response\": string|null, \
\"reasoning\": string}. Use can_answer_from_context only when prior \
findings already answer the question; set needs_context_lookup when the \
answer depends on current market or news context.";

#[async_trait]
pub trait Router: Send + Sync {
    async fn route(
        &self,
        message: &str,
        history: &[MessageRecord],
        last_findings: &FindingsMap,
    ) -> RoutingDecision;
}

/// Deterministic intent routing for high-confidence messages. Returns
/// `None` when the message needs the model's judgment.
pub fn route_by_intent(message: &str) -> Option<RoutingDecision> {
    let lowered = message.to_lowercase();
    let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    // Selling a position is always a tax question, usually a harvesting
    // one, and never a contribution-allocation one.
    if has_any(&["sell", "selling", "sold", "unload", "dump"])
        && has_any(&["position", "share", "shares", "stock", "holding", ".to", "etf"])
    {
        return Some(decision(
            vec![Capability::TaxImplications, Capability::LossHarvesting],
            "sell intent: tax consequences and harvesting angle",
        ));
    }

    if has_any(&["contribution room", "contribute", "tfsa room", "rrsp room", "fhsa room"]) {
        return Some(decision(
            vec![Capability::Allocation, Capability::Timing],
            "contribution intent: allocation and deadlines",
        ));
    }

    if has_any(&["margin", "interest rate", "borrow"]) {
        return Some(decision(
            vec![Capability::RateArbitrage],
            "rate intent: margin cost analysis",
        ));
    }

    if has_any(&["deadline", "last day", "cutoff"]) {
        return Some(decision(
            vec![Capability::Timing],
            "deadline intent: time-sensitive check",
        ));
    }

    None
}

fn decision(capabilities: Vec<Capability>, reasoning: &str) -> RoutingDecision {
    RoutingDecision {
        capabilities_to_invoke: capabilities,
        needs_context_lookup: false,
        context_query: None,
        can_answer_from_context: false,
        direct_response: None,
        reasoning: reasoning.to_string(),
    }
}

pub struct LlmRouter {
    client: Arc<ClaudeClient>,
}

impl LlmRouter {
    pub fn new(client: Arc<ClaudeClient>) -> Self {
        Self { client }
    }

    async fn route_with_llm(
        &self,
        message: &str,
        history: &[MessageRecord],
        last_findings: &FindingsMap,
    ) -> Result<RoutingDecision> {
        let recent: Vec<_> = history
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|record| json!({"role": record.role, "content": record.content}))
            .collect();

        // First finding per domain only, to bound the payload.
        let findings_summary: serde_json::Map<String, serde_json::Value> = last_findings
            .iter()
            .filter_map(|(domain, findings)| {
                findings
                    .first()
                    .map(|f| (domain.clone(), json!([f])))
            })
            .collect();

        let user_content = serde_json::to_string(&json!({
            "user_message": message,
            "conversation_history": recent,
            "last_findings_summary": findings_summary,
        }))?;

        let raw = self
            .client
            .complete(ROUTER_SYSTEM_PROMPT, &user_content, 512)
            .await?;

        parse_decision(&raw)
    }
}

#[async_trait]
impl Router for LlmRouter {
    async fn route(
        &self,
        message: &str,
        history: &[MessageRecord],
        last_findings: &FindingsMap,
    ) -> RoutingDecision {
        if let Some(decision) = route_by_intent(message) {
            info!(reasoning = %decision.reasoning, "Routed by intent");
            return decision;
        }

        match self.route_with_llm(message, history, last_findings).await {
            Ok(decision) => decision,
            Err(e) => {
                error!("Router failed, invoking all capabilities: {}", e);
                RoutingDecision::fallback("router error, invoking all capabilities")
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default, alias = "agents_to_invoke")]
    capabilities_to_invoke: Vec<String>,
    #[serde(default)]
    needs_context_lookup: bool,
    #[serde(default)]
    context_query: Option<String>,
    #[serde(default)]
    can_answer_from_context: bool,
    #[serde(default)]
    direct_response: Option<String>,
    #[serde(default, alias = "routing_reasoning")]
    reasoning: String,
}

fn parse_decision(raw: &str) -> Result<RoutingDecision> {
    let parsed: RawDecision = serde_json::from_str(strip_code_fences(raw))?;

    // Ordered set: unknown names dropped, duplicates keep first position.
    let mut seen = HashSet::new();
    let capabilities: Vec<Capability> = parsed
        .capabilities_to_invoke
        .iter()
        .filter_map(|name| Capability::from_name(name))
        .filter(|c| seen.insert(*c))
        .collect();

    Ok(RoutingDecision {
        capabilities_to_invoke: capabilities,
        needs_context_lookup: parsed.needs_context_lookup,
        context_query: parsed.context_query.filter(|q| !q.trim().is_empty()),
        can_answer_from_context: parsed.can_answer_from_context,
        direct_response: parsed.direct_response.filter(|r| !r.trim().is_empty()),
        reasoning: parsed.reasoning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sell_question_routes_to_tax_and_harvesting() {
        let decision =
            route_by_intent("Should I sell my SHOP.TO position?").expect("intent route");

        assert!(decision
            .capabilities_to_invoke
            .contains(&Capability::TaxImplications));
        assert!(decision
            .capabilities_to_invoke
            .contains(&Capability::LossHarvesting));
        assert!(!decision
            .capabilities_to_invoke
            .contains(&Capability::Allocation));
        assert!(!decision.can_answer_from_context);
    }

    #[test]
    fn test_ambiguous_message_defers_to_llm() {
        assert!(route_by_intent("How am I doing overall?").is_none());
    }

    #[test]
    fn test_contribution_question_routes_to_allocation() {
        let decision = route_by_intent("How much TFSA room do I have to contribute?")
            .expect("intent route");
        assert!(decision
            .capabilities_to_invoke
            .contains(&Capability::Allocation));
    }

    #[test]
    fn test_parse_decision_dedupes_and_drops_unknown() {
        let raw = r#"{
            "capabilities_to_invoke": ["tlh", "tax_implications", "tlh", "astrology"],
            "needs_context_lookup": true,
            "context_query": "CRA deadline news",
            "can_answer_from_context": false,
            "direct_response": null,
            "reasoning": "test"
        }"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(
            decision.capabilities_to_invoke,
            vec![Capability::LossHarvesting, Capability::TaxImplications]
        );
        assert!(decision.needs_context_lookup);
        assert_eq!(decision.context_query.as_deref(), Some("CRA deadline news"));
    }

    #[test]
    fn test_parse_decision_accepts_fenced_payload() {
        let raw = "```json\n{\"capabilities_to_invoke\": [\"timing\"], \"reasoning\": \"r\"}\n```";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.capabilities_to_invoke, vec![Capability::Timing]);
    }
}
