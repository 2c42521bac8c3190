//! Streamed turn protocol
//!
//! One user turn is emitted as an ordered sequence of events:
//! `routing → [context_lookup_start → context_lookup_complete]? →
//! (agent_start, handoff)×N → agent_complete×N → response → [sources]? →
//! (handoff → agent_start → agent_complete → auto_referral_response)×{0,1}
//! → follow_ups → done`, or a terminal `error` replacing the remainder.

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::capability::Capability;
use crate::error::OrchestratorError;
use crate::models::{Citation, RoutingDecision};
use crate::Result;

#[derive(Debug, Clone)]
pub enum TurnEvent {
    Routing {
        decision: RoutingDecision,
    },
    ContextLookupStart {
        query: String,
    },
    ContextLookupComplete {
        results: Vec<Citation>,
        error: Option<String>,
    },
    AgentStart {
        capability: Capability,
    },
    Handoff {
        capability: Capability,
        message: String,
    },
    AgentComplete {
        capability: Capability,
        finding_count: usize,
        error: Option<String>,
    },
    Response {
        text: String,
    },
    Sources {
        sources: Vec<Citation>,
    },
    AutoReferralResponse {
        capability: Capability,
        text: String,
    },
    FollowUps {
        chips: Vec<String>,
    },
    Done {
        session_id: String,
    },
    Error {
        message: String,
    },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Routing { .. } => "routing",
            TurnEvent::ContextLookupStart { .. } => "context_lookup_start",
            TurnEvent::ContextLookupComplete { .. } => "context_lookup_complete",
            TurnEvent::AgentStart { .. } => "agent_start",
            TurnEvent::Handoff { .. } => "handoff",
            TurnEvent::AgentComplete { .. } => "agent_complete",
            TurnEvent::Response { .. } => "response",
            TurnEvent::Sources { .. } => "sources",
            TurnEvent::AutoReferralResponse { .. } => "auto_referral_response",
            TurnEvent::FollowUps { .. } => "follow_ups",
            TurnEvent::Done { .. } => "done",
            TurnEvent::Error { .. } => "error",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            TurnEvent::Routing { decision } => json!({
                "capabilities_to_invoke": decision.capabilities_to_invoke,
                "reasoning": decision.reasoning,
                "can_answer_from_context": decision.can_answer_from_context,
                "needs_context_lookup": decision.needs_context_lookup,
            }),
            TurnEvent::ContextLookupStart { query } => json!({ "query": query }),
            TurnEvent::ContextLookupComplete { results, error } => {
                let mut payload = json!({
                    "result_count": results.len(),
                    "results": results,
                });
                if let Some(error) = error {
                    payload["error"] = json!(error);
                }
                payload
            }
            TurnEvent::AgentStart { capability } => json!({ "agent": capability }),
            TurnEvent::Handoff {
                capability,
                message,
            } => json!({ "agent": capability, "message": message }),
            TurnEvent::AgentComplete {
                capability,
                finding_count,
                error,
            } => {
                let mut payload = json!({
                    "agent": capability,
                    "finding_count": finding_count,
                });
                if let Some(error) = error {
                    payload["error"] = json!(error);
                }
                payload
            }
            TurnEvent::Response { text } => json!({ "text": text }),
            TurnEvent::Sources { sources } => json!({ "sources": sources }),
            TurnEvent::AutoReferralResponse { capability, text } => {
                json!({ "agent": capability, "text": text })
            }
            TurnEvent::FollowUps { chips } => json!({ "chips": chips }),
            TurnEvent::Done { session_id } => json!({ "session_id": session_id }),
            TurnEvent::Error { message } => json!({ "message": message }),
        }
    }
}

/// Channel wrapper whose failed send means the client hung up. The
/// orchestrator uses that signal to cancel the turn and skip persistence.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: TurnEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| OrchestratorError::ClientDisconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_protocol() {
        let event = TurnEvent::Done {
            session_id: "chat-2025-01-01-abcd1234".to_string(),
        };
        assert_eq!(event.name(), "done");
        assert_eq!(
            event.payload()["session_id"],
            "chat-2025-01-01-abcd1234"
        );
    }

    #[test]
    fn test_agent_complete_carries_error_marker() {
        let ok = TurnEvent::AgentComplete {
            capability: Capability::Timing,
            finding_count: 2,
            error: None,
        };
        assert!(ok.payload().get("error").is_none());

        let failed = TurnEvent::AgentComplete {
            capability: Capability::Timing,
            finding_count: 0,
            error: Some("boom".to_string()),
        };
        assert_eq!(failed.payload()["error"], "boom");
        assert_eq!(failed.payload()["agent"], "timing");
    }

    #[test]
    fn test_emit_delivers_to_receiver() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(1);
            EventSender::new(tx)
                .emit(TurnEvent::FollowUps { chips: vec![] })
                .await
                .unwrap();
            let received = rx.recv().await.unwrap();
            assert_eq!(received.name(), "follow_ups");
        });
    }

    #[tokio::test]
    async fn test_emit_after_disconnect_reports_hangup() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        drop(rx);
        let result = sender
            .emit(TurnEvent::Response {
                text: "hello".to_string(),
            })
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ClientDisconnected)
        ));
    }
}
