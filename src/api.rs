//! REST API server
//!
//! Exposes the turn orchestrator and its sibling flows over HTTP. The chat
//! turn streams as server-sent events; everything else is plain JSON.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::advisor::{self, AdvisorService};
use crate::capability::CapabilityInvoker;
use crate::intercept;
use crate::models::FindingsMap;
use crate::monitor::AlertStore;
use crate::orchestrator::TurnOrchestrator;
use crate::protocol::EventSender;
use crate::snapshot::{SnapshotProvider, TradeAction};
use crate::synthesizer::Synthesizer;
use crate::whatif::{self, WhatIfParameters, WhatIfScenario};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct WhatIfRequest {
    pub session_id: String,
    pub scenario: WhatIfScenario,
    pub parameters: WhatIfParameters,
}

#[derive(Debug, Deserialize)]
pub struct InterceptRequest {
    pub account_id: i64,
    pub ticker: String,
    pub shares: f64,
    pub action: TradeAction,
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub invoker: Arc<CapabilityInvoker>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub advisor: Arc<AdvisorService>,
    pub alerts: Arc<AlertStore>,
    pub ruleset: Value,
    pub demo_user: Uuid,
}

/// =============================
/// Helpers
/// =============================

/// Deterministic UUID derived from a caller-supplied string id.
pub fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Fingerprint of the loaded tax ruleset, for the health endpoint.
pub fn ruleset_fingerprint(ruleset: &Value) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(ruleset.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Tax ruleset handed verbatim to capabilities: a JSON file named by
/// `TAX_RULES_PATH`, or built-in defaults.
pub fn load_ruleset() -> Value {
    if let Ok(path) = std::env::var("TAX_RULES_PATH") {
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => return value,
                Err(e) => tracing::warn!(path, "Ignoring unparseable tax rules: {}", e),
            },
            Err(e) => tracing::warn!(path, "Could not read tax rules: {}", e),
        }
    }

    json!({
        "tax_year": 2024,
        "tfsa_annual_limit": 7000,
        "rrsp_contribution_rate": 0.18,
        "rrsp_deadline": "2025-03-03",
        "fhsa_annual_limit": 8000,
        "capital_gains_inclusion_rate": 0.5,
        "superficial_loss_window_days": 30,
        "marginal_rate_estimate": 0.43
    })
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn findings_map_by_source(findings: &[crate::models::Finding]) -> FindingsMap {
    let mut map = FindingsMap::new();
    for finding in findings {
        let domain = finding
            .source
            .as_deref()
            .and_then(crate::capability::Capability::from_name)
            .map(|c| c.domain_key().to_string())
            .or_else(|| finding.domain.clone())
            .unwrap_or_else(|| "general".to_string());
        map.entry(domain).or_default().push(finding.clone());
    }
    map
}

/// =============================
/// Health
/// =============================

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "ruleset_fingerprint": ruleset_fingerprint(&state.ruleset),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// =============================
/// Session lifecycle
/// =============================

async fn create_session(State(state): State<ApiState>) -> Response {
    let sessions = state.orchestrator.sessions();

    match sessions.find_today(state.demo_user).await {
        Ok(Some(existing)) => {
            let greeting = existing
                .messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_else(|| "Welcome back. Ask me anything.".to_string());
            return Json(json!({
                "session_id": existing.session_id,
                "greeting": greeting,
                "top_findings": [],
                "agent_sources": [],
                "restored": true,
            }))
            .into_response();
        }
        Ok(None) => {}
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let snapshot = match state.snapshots.snapshot(state.demo_user).await {
        Ok(snapshot) => snapshot,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let greeting = advisor::generate_greeting(
        &state.invoker,
        &state.synthesizer,
        &snapshot,
        &state.ruleset,
    )
    .await;

    let last_findings = findings_map_by_source(&greeting.top_findings);
    let opening = crate::models::MessageRecord::assistant(
        greeting.message.clone(),
        greeting.agent_sources.clone(),
        last_findings.clone(),
    );

    match sessions
        .create_today(state.demo_user, opening, last_findings)
        .await
    {
        Ok(session) => Json(json!({
            "session_id": session.session_id,
            "greeting": greeting.message,
            "top_findings": greeting.top_findings,
            "agent_sources": greeting.agent_sources,
        }))
        .into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn clear_session(State(state): State<ApiState>) -> Response {
    match state
        .orchestrator
        .sessions()
        .clear_today(state.demo_user)
        .await
    {
        Ok(cleared) => Json(json!({ "cleared": cleared })).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.orchestrator.sessions().get(&session_id).await {
        Ok(Some(session)) => Json(json!({
            "session_id": session.session_id,
            "messages": session.messages,
            "last_findings": session.last_findings,
            "created_at": session.created_at,
            "updated_at": session.updated_at,
        }))
        .into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// =============================
/// Streamed chat turn (SSE)
/// =============================

async fn chat_message(
    State(state): State<ApiState>,
    Json(body): Json<ChatMessageRequest>,
) -> Response {
    match state.orchestrator.sessions().get(&body.session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let (tx, rx) = mpsc::channel(64);
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        orchestrator
            .run_turn(&body.session_id, &body.message, EventSender::new(tx))
            .await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.payload().to_string()),
        )
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// =============================
/// What-if
/// =============================

async fn chat_whatif(
    State(state): State<ApiState>,
    Json(body): Json<WhatIfRequest>,
) -> Response {
    match state.orchestrator.sessions().get(&body.session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let baseline = match state.snapshots.snapshot(state.demo_user).await {
        Ok(snapshot) => snapshot,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let report = whatif::run_what_if(
        &state.invoker,
        &baseline,
        body.scenario,
        &body.parameters,
        &state.ruleset,
    )
    .await;

    Json(json!(report)).into_response()
}

/// =============================
/// Batch analysis
/// =============================

async fn analyze(State(state): State<ApiState>) -> Response {
    let snapshot = match state.snapshots.snapshot(state.demo_user).await {
        Ok(snapshot) => snapshot,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let run_id = Uuid::new_v4();
    let (insights, _) =
        advisor::run_full_analysis(&state.invoker, &snapshot, &state.ruleset).await;

    Json(json!({
        "run_id": run_id,
        "insight_count": insights.len(),
        "insights": insights,
    }))
    .into_response()
}

/// =============================
/// Trade interception
/// =============================

async fn trade_intercept(
    State(state): State<ApiState>,
    Json(body): Json<InterceptRequest>,
) -> Response {
    let snapshot = match state.snapshots.snapshot(state.demo_user).await {
        Ok(snapshot) => snapshot,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let verdict = intercept::intercept_trade(
        &state.invoker,
        &snapshot,
        body.account_id,
        &body.ticker,
        body.shares,
        body.action,
        &state.ruleset,
    )
    .await;

    Json(json!(verdict)).into_response()
}

/// =============================
/// Advisor report + monitor alerts
/// =============================

async fn advisor_report(State(state): State<ApiState>) -> Response {
    let snapshot = match state.snapshots.snapshot(state.demo_user).await {
        Ok(snapshot) => snapshot,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let report = state.advisor.report(&snapshot, &state.ruleset).await;
    Json(json!(report)).into_response()
}

async fn monitor_alerts(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.alerts.drain_pending()))
}

/// =============================
/// Router + server startup
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat/session", post(create_session).delete(clear_session))
        .route("/chat/session/:session_id", get(get_session))
        .route("/chat/message", post(chat_message))
        .route("/chat/whatif", post(chat_whatif))
        .route("/analyze", post(analyze))
        .route("/trade/intercept", post(trade_intercept))
        .route("/advisor/report", post(advisor_report))
        .route("/monitor/alerts", get(monitor_alerts))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = stable_uuid_from_string("demo-user");
        let b = stable_uuid_from_string("demo-user");
        let c = stable_uuid_from_string("someone-else");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn test_builtin_ruleset_has_core_fields() {
        std::env::remove_var("TAX_RULES_PATH");
        let ruleset = load_ruleset();
        assert!(ruleset["tfsa_annual_limit"].is_number());
        assert!(!ruleset_fingerprint(&ruleset).is_empty());
    }
}
