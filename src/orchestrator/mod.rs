//! Turn orchestration
//!
//! One user message runs as a single task through the state machine
//! ROUTING → (CONTEXT_LOOKUP)? → ANSWERING → REFERRING → FOLLOWUP →
//! PERSISTED, emitting protocol events along the way. Fan-outs happen at
//! primary capability dispatch and referral evaluation; their results are
//! put back into request order before any event tied to them is emitted.
//! An unhandled fault short-circuits to a terminal `error` event and
//! nothing is persisted for the turn.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::capability::{referral_handoff, CapabilityInvoker, ReferralSource};
use crate::error::OrchestratorError;
use crate::models::{Citation, FindingsMap, MessageRecord, TurnState};
use crate::protocol::{EventSender, TurnEvent};
use crate::referral::{evaluate_candidates, ReferralEvaluator};
use crate::router::Router;
use crate::search::ContextSearch;
use crate::session::SessionStore;
use crate::snapshot::SnapshotProvider;
use crate::synthesizer::Synthesizer;
use crate::Result;

/// At most one accepted referral per turn, bounding worst-case latency to
/// two capability-invocation rounds.
pub const MAX_AUTO_REFERRALS: u32 = 1;

pub struct TurnOrchestrator {
    router: Arc<dyn Router>,
    invoker: Arc<CapabilityInvoker>,
    evaluator: Arc<dyn ReferralEvaluator>,
    synthesizer: Arc<dyn Synthesizer>,
    search: Option<Arc<dyn ContextSearch>>,
    sessions: Arc<dyn SessionStore>,
    snapshots: Arc<dyn SnapshotProvider>,
    ruleset: Value,
}

impl TurnOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<dyn Router>,
        invoker: Arc<CapabilityInvoker>,
        evaluator: Arc<dyn ReferralEvaluator>,
        synthesizer: Arc<dyn Synthesizer>,
        search: Option<Arc<dyn ContextSearch>>,
        sessions: Arc<dyn SessionStore>,
        snapshots: Arc<dyn SnapshotProvider>,
        ruleset: Value,
    ) -> Self {
        Self {
            router,
            invoker,
            evaluator,
            synthesizer,
            search,
            sessions,
            snapshots,
            ruleset,
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Drive one turn, emitting events on `events`. Terminal faults become
    /// a single `error` event; a dropped receiver cancels the turn without
    /// persisting anything.
    pub async fn run_turn(&self, session_id: &str, message: &str, events: EventSender) {
        match self.execute_turn(session_id, message, &events).await {
            Ok(()) => {}
            Err(OrchestratorError::ClientDisconnected) => {
                info!(session_id, "Client disconnected; turn abandoned without persistence");
            }
            Err(e) => {
                warn!(session_id, "Turn failed: {}", e);
                // best effort: the receiver may already be gone
                let _ = events
                    .emit(TurnEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn execute_turn(
        &self,
        session_id: &str,
        message: &str,
        events: &EventSender,
    ) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        // Fresh snapshot every turn, never session-stored data.
        let snapshot = self.snapshots.snapshot(session.user_id).await?;
        let mut state = TurnState::new(MAX_AUTO_REFERRALS);

        // ── ROUTING ──────────────────────────────────────────────────
        let routing = self
            .router
            .route(message, &session.messages, &session.last_findings)
            .await;
        events
            .emit(TurnEvent::Routing {
                decision: routing.clone(),
            })
            .await?;

        // ── CONTEXT_LOOKUP (optional; fails open) ────────────────────
        let mut citations: Vec<Citation> = Vec::new();
        if routing.needs_context_lookup {
            if let (Some(query), Some(search)) = (&routing.context_query, &self.search) {
                events
                    .emit(TurnEvent::ContextLookupStart {
                        query: query.clone(),
                    })
                    .await?;
                match search.search(query).await {
                    Ok(results) => {
                        citations = results;
                        events
                            .emit(TurnEvent::ContextLookupComplete {
                                results: citations.clone(),
                                error: None,
                            })
                            .await?;
                    }
                    Err(e) => {
                        warn!("Context lookup failed: {}", e);
                        events
                            .emit(TurnEvent::ContextLookupComplete {
                                results: Vec::new(),
                                error: Some(e.to_string()),
                            })
                            .await?;
                    }
                }
            }
        }

        // ── ANSWERING ────────────────────────────────────────────────
        let direct = routing.can_answer_from_context
            || routing.capabilities_to_invoke.is_empty();

        let mut findings_map: FindingsMap;
        let mut final_response: String;
        let referral_sources: Vec<ReferralSource>;

        if direct {
            findings_map = session.last_findings.clone();

            final_response = match routing.direct_response.clone() {
                Some(text) if citations.is_empty() => text,
                // a context lookup ran, or the router supplied no text:
                // synthesize so the citations (or prior findings) are used
                _ => {
                    let payload = synthesis_payload(&findings_map, &citations);
                    self.synthesizer
                        .synthesize_response(message, &payload, &session.messages)
                        .await
                }
            };

            events
                .emit(TurnEvent::Response {
                    text: final_response.clone(),
                })
                .await?;
            if !citations.is_empty() {
                events
                    .emit(TurnEvent::Sources {
                        sources: citations.clone(),
                    })
                    .await?;
            }

            state.record(ReferralSource::DirectResponse);
            referral_sources = vec![ReferralSource::DirectResponse];
        } else {
            let capabilities = routing.capabilities_to_invoke.clone();
            for &capability in &capabilities {
                events.emit(TurnEvent::AgentStart { capability }).await?;
                events
                    .emit(TurnEvent::Handoff {
                        capability,
                        message: capability.handoff_message().to_string(),
                    })
                    .await?;
                state.record(ReferralSource::Capability(capability));
            }

            // concurrent dispatch; outcomes come back in request order
            let outcomes = self
                .invoker
                .run_group(&capabilities, &snapshot, &self.ruleset)
                .await;

            findings_map = FindingsMap::new();
            for outcome in &outcomes {
                events
                    .emit(TurnEvent::AgentComplete {
                        capability: outcome.capability,
                        finding_count: outcome.findings.len(),
                        error: outcome.error.clone(),
                    })
                    .await?;
                findings_map.insert(
                    outcome.capability.domain_key().to_string(),
                    outcome.findings.clone(),
                );
            }

            let payload = synthesis_payload(&findings_map, &citations);
            final_response = self
                .synthesizer
                .synthesize_response(message, &payload, &session.messages)
                .await;

            events
                .emit(TurnEvent::Response {
                    text: final_response.clone(),
                })
                .await?;
            if !citations.is_empty() {
                events
                    .emit(TurnEvent::Sources {
                        sources: citations.clone(),
                    })
                    .await?;
            }

            referral_sources = capabilities
                .iter()
                .map(|&c| ReferralSource::Capability(c))
                .collect();
        }

        // ── REFERRING ────────────────────────────────────────────────
        let accepted = evaluate_candidates(
            &self.evaluator,
            &state,
            message,
            &final_response,
            &findings_map,
        )
        .await;

        for referral in accepted {
            if state.referral_budget_remaining == 0 {
                break;
            }
            let capability = referral.capability;
            if state.has_invoked(capability) {
                continue;
            }

            events
                .emit(TurnEvent::Handoff {
                    capability,
                    message: referral_handoff(&referral_sources, capability).to_string(),
                })
                .await?;
            events.emit(TurnEvent::AgentStart { capability }).await?;

            match self
                .invoker
                .run_one(capability, &snapshot, &self.ruleset)
                .await
            {
                Ok(findings) => {
                    events
                        .emit(TurnEvent::AgentComplete {
                            capability,
                            finding_count: findings.len(),
                            error: None,
                        })
                        .await?;

                    let mut referral_map = FindingsMap::new();
                    referral_map.insert(capability.domain_key().to_string(), findings.clone());
                    findings_map.insert(capability.domain_key().to_string(), findings);

                    state.record(ReferralSource::Capability(capability));
                    state.referral_budget_remaining -= 1;

                    // the re-synthesized text supersedes the previous final response
                    let payload = synthesis_payload(&referral_map, &citations);
                    final_response = self
                        .synthesizer
                        .synthesize_response(message, &payload, &session.messages)
                        .await;
                    events
                        .emit(TurnEvent::AutoReferralResponse {
                            capability,
                            text: final_response.clone(),
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(capability = %capability, "Referral invocation failed: {}", e);
                    events
                        .emit(TurnEvent::AgentComplete {
                            capability,
                            finding_count: 0,
                            error: Some(e.to_string()),
                        })
                        .await?;
                }
            }
        }

        // ── FOLLOWUP ─────────────────────────────────────────────────
        let chips = self
            .synthesizer
            .generate_follow_ups(message, &final_response, &json!(findings_map))
            .await;
        events.emit(TurnEvent::FollowUps { chips }).await?;

        // ── PERSISTED ────────────────────────────────────────────────
        let mut agent_sources: Vec<String> = state
            .invoked
            .iter()
            .filter_map(|source| match source {
                ReferralSource::Capability(c) => Some(c.name().to_string()),
                ReferralSource::DirectResponse => None,
            })
            .collect();
        agent_sources.sort();
        if !citations.is_empty() {
            agent_sources.push("context_search".to_string());
        }

        self.sessions
            .append_exchange(
                session_id,
                MessageRecord::user(message),
                MessageRecord::assistant(
                    final_response.clone(),
                    agent_sources,
                    findings_map.clone(),
                ),
                findings_map,
            )
            .await?;

        events
            .emit(TurnEvent::Done {
                session_id: session_id.to_string(),
            })
            .await?;

        Ok(())
    }
}

/// Findings payload handed to the synthesizer: the findings map plus any
/// context citations, so the prose step can cite them.
fn synthesis_payload(findings: &FindingsMap, citations: &[Citation]) -> Value {
    let mut payload = json!(findings);
    if !citations.is_empty() {
        payload["context_citations"] = json!(citations);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        Capability, CapabilityRunner, StaticCapabilityRunner,
    };
    use crate::models::{
        Confidence, Finding, ImpactDirection, RoutingDecision, Urgency,
    };
    use crate::referral::ReferralVerdict;
    use crate::session::{InMemorySessionStore, SessionStore};
    use crate::snapshot::{DemoSnapshotProvider, FinancialSnapshot};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn finding(title: &str, impact: f64) -> Finding {
        Finding {
            title: title.to_string(),
            dollar_impact: impact,
            impact_direction: ImpactDirection::Save,
            urgency: Urgency::Evergreen,
            reasoning: "r".to_string(),
            confidence: Confidence::High,
            what_to_do: "w".to_string(),
            domain: None,
            source: None,
        }
    }

    struct CannedRouter(RoutingDecision);

    #[async_trait]
    impl Router for CannedRouter {
        async fn route(
            &self,
            _message: &str,
            _history: &[MessageRecord],
            _last_findings: &FindingsMap,
        ) -> RoutingDecision {
            self.0.clone()
        }
    }

    struct CannedSynthesizer;

    #[async_trait]
    impl Synthesizer for CannedSynthesizer {
        async fn synthesize_response(
            &self,
            _message: &str,
            _findings: &Value,
            _history: &[MessageRecord],
        ) -> String {
            "synthesized answer".to_string()
        }

        async fn generate_follow_ups(
            &self,
            _message: &str,
            _response: &str,
            _findings: &Value,
        ) -> Vec<String> {
            vec!["What about my RRSP?".to_string()]
        }

        async fn synthesize_greeting(
            &self,
            _top_findings: &[Finding],
            _snapshot: &FinancialSnapshot,
        ) -> String {
            "welcome".to_string()
        }
    }

    struct AcceptOnly(Option<Capability>);

    #[async_trait]
    impl ReferralEvaluator for AcceptOnly {
        async fn evaluate(
            &self,
            candidate: Capability,
            _message: &str,
            _response: &str,
            _findings: &FindingsMap,
        ) -> crate::Result<ReferralVerdict> {
            Ok(ReferralVerdict {
                refer: self.0 == Some(candidate),
                reason: "test".to_string(),
            })
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl ReferralEvaluator for AcceptAll {
        async fn evaluate(
            &self,
            _candidate: Capability,
            _message: &str,
            _response: &str,
            _findings: &FindingsMap,
        ) -> crate::Result<ReferralVerdict> {
            Ok(ReferralVerdict {
                refer: true,
                reason: "test".to_string(),
            })
        }
    }

    struct PartiallyFailingRunner;

    #[async_trait]
    impl CapabilityRunner for PartiallyFailingRunner {
        async fn run(
            &self,
            capability: Capability,
            _snapshot: &FinancialSnapshot,
            _ruleset: &Value,
        ) -> crate::Result<Vec<Finding>> {
            if capability == Capability::LossHarvesting {
                Err(OrchestratorError::CapabilityError("upstream died".to_string()))
            } else {
                Ok(vec![finding(capability.name(), 250.0)])
            }
        }
    }

    struct Fixture {
        orchestrator: TurnOrchestrator,
        sessions: Arc<dyn SessionStore>,
        session_id: String,
    }

    async fn fixture(
        decision: RoutingDecision,
        runner: Arc<dyn CapabilityRunner>,
        evaluator: Arc<dyn ReferralEvaluator>,
    ) -> Fixture {
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let session = sessions
            .create_today(
                Uuid::new_v4(),
                MessageRecord::assistant("welcome", vec![], FindingsMap::new()),
                FindingsMap::new(),
            )
            .await
            .unwrap();

        let orchestrator = TurnOrchestrator::new(
            Arc::new(CannedRouter(decision)),
            Arc::new(CapabilityInvoker::new(runner)),
            evaluator,
            Arc::new(CannedSynthesizer),
            None,
            Arc::clone(&sessions),
            Arc::new(DemoSnapshotProvider),
            json!({}),
        );

        Fixture {
            orchestrator,
            sessions,
            session_id: session.session_id,
        }
    }

    async fn run_and_collect(fixture: &Fixture, message: &str) -> Vec<TurnEvent> {
        let (tx, mut rx) = mpsc::channel(256);
        fixture
            .orchestrator
            .run_turn(&fixture.session_id, message, EventSender::new(tx))
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[TurnEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    fn agentic_decision(capabilities: Vec<Capability>) -> RoutingDecision {
        RoutingDecision {
            capabilities_to_invoke: capabilities,
            needs_context_lookup: false,
            context_query: None,
            can_answer_from_context: false,
            direct_response: None,
            reasoning: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failing_capability_still_reaches_done() {
        let fixture = fixture(
            agentic_decision(vec![
                Capability::TaxImplications,
                Capability::LossHarvesting,
            ]),
            Arc::new(PartiallyFailingRunner),
            Arc::new(AcceptOnly(None)),
        )
        .await;

        let events = run_and_collect(&fixture, "Should I sell?").await;
        assert_eq!(
            names(&events),
            vec![
                "routing",
                "agent_start",
                "handoff",
                "agent_start",
                "handoff",
                "agent_complete",
                "agent_complete",
                "response",
                "follow_ups",
                "done",
            ]
        );

        // the failing capability carries the error marker, its sibling kept
        // its findings
        let completes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::AgentComplete {
                    capability,
                    finding_count,
                    error,
                } => Some((*capability, *finding_count, error.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(completes[0], (Capability::TaxImplications, 1, None));
        assert_eq!(completes[1].0, Capability::LossHarvesting);
        assert_eq!(completes[1].1, 0);
        assert!(completes[1].2.is_some());

        // the turn persisted both records
        let session = fixture
            .sessions
            .get(&fixture.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[2].content, "synthesized answer");
    }

    #[tokio::test]
    async fn test_direct_response_still_runs_referral_expander() {
        let decision = RoutingDecision {
            capabilities_to_invoke: vec![],
            needs_context_lookup: false,
            context_query: None,
            can_answer_from_context: true,
            direct_response: Some("You already asked this — see above.".to_string()),
            reasoning: "context".to_string(),
        };
        let mut canned = HashMap::new();
        canned.insert(Capability::Timing, vec![finding("RRSP deadline", 900.0)]);

        let fixture = fixture(
            decision,
            Arc::new(StaticCapabilityRunner::new(canned)),
            Arc::new(AcceptOnly(Some(Capability::Timing))),
        )
        .await;

        let events = run_and_collect(&fixture, "thanks!").await;
        assert_eq!(
            names(&events),
            vec![
                "routing",
                "response",
                "handoff",
                "agent_start",
                "agent_complete",
                "auto_referral_response",
                "follow_ups",
                "done",
            ]
        );

        // the referral's re-synthesized text becomes the persisted answer
        let session = fixture
            .sessions
            .get(&fixture.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.messages[2].content, "synthesized answer");
        assert!(session.messages[2]
            .agent_sources
            .contains(&"timing".to_string()));
        assert!(session.last_findings.contains_key("timing"));
    }

    #[tokio::test]
    async fn test_referral_budget_is_never_exceeded() {
        // every candidate is accepted, but the budget allows exactly one
        let fixture = fixture(
            agentic_decision(vec![Capability::TaxImplications]),
            Arc::new(StaticCapabilityRunner::empty()),
            Arc::new(AcceptAll),
        )
        .await;

        let events = run_and_collect(&fixture, "tax question").await;
        let referral_count = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::AutoReferralResponse { .. }))
            .count();
        assert_eq!(referral_count, 1);

        // and the referral target was not one of the primary capabilities
        let referred = events.iter().find_map(|e| match e {
            TurnEvent::AutoReferralResponse { capability, .. } => Some(*capability),
            _ => None,
        });
        assert_ne!(referred, Some(Capability::TaxImplications));
    }

    #[tokio::test]
    async fn test_disconnect_skips_persistence() {
        let fixture = fixture(
            agentic_decision(vec![Capability::TaxImplications]),
            Arc::new(StaticCapabilityRunner::empty()),
            Arc::new(AcceptOnly(None)),
        )
        .await;

        let (tx, rx) = mpsc::channel(256);
        drop(rx);
        fixture
            .orchestrator
            .run_turn(&fixture.session_id, "hello?", EventSender::new(tx))
            .await;

        let session = fixture
            .sessions
            .get(&fixture.session_id)
            .await
            .unwrap()
            .unwrap();
        // only the opening message; the half-finished exchange was dropped
        assert_eq!(session.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_emits_terminal_error() {
        let fixture = fixture(
            agentic_decision(vec![Capability::TaxImplications]),
            Arc::new(StaticCapabilityRunner::empty()),
            Arc::new(AcceptOnly(None)),
        )
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        fixture
            .orchestrator
            .run_turn("chat-nope", "hello", EventSender::new(tx))
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "error");
    }
}
