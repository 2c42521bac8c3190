use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use wealthmind_orchestrator::capability::StaticCapabilityRunner;
use wealthmind_orchestrator::models::{
    Confidence, Finding, FindingsMap, ImpactDirection, MessageRecord, Urgency,
};
use wealthmind_orchestrator::referral::{ReferralEvaluator, ReferralVerdict};
use wealthmind_orchestrator::router::LlmRouter;
use wealthmind_orchestrator::session::{InMemorySessionStore, SessionStore};
use wealthmind_orchestrator::snapshot::DemoSnapshotProvider;
use wealthmind_orchestrator::synthesizer::Synthesizer;
use wealthmind_orchestrator::{
    Capability, CapabilityInvoker, EventSender, TurnOrchestrator,
};

/// Offline stand-ins so the demo runs without an API key.
struct OfflineSynthesizer;

#[async_trait::async_trait]
impl Synthesizer for OfflineSynthesizer {
    async fn synthesize_response(
        &self,
        _message: &str,
        findings: &serde_json::Value,
        _history: &[MessageRecord],
    ) -> String {
        format!("Here is what the analysis found: {}", findings)
    }

    async fn generate_follow_ups(
        &self,
        _message: &str,
        _response: &str,
        _findings: &serde_json::Value,
    ) -> Vec<String> {
        vec!["What should I do first?".to_string()]
    }

    async fn synthesize_greeting(
        &self,
        _top_findings: &[Finding],
        snapshot: &wealthmind_orchestrator::snapshot::FinancialSnapshot,
    ) -> String {
        wealthmind_orchestrator::synthesizer::fallback_greeting(snapshot)
    }
}

struct OfflineEvaluator;

#[async_trait::async_trait]
impl ReferralEvaluator for OfflineEvaluator {
    async fn evaluate(
        &self,
        candidate: Capability,
        _message: &str,
        _response: &str,
        _findings: &FindingsMap,
    ) -> wealthmind_orchestrator::Result<ReferralVerdict> {
        Ok(ReferralVerdict {
            refer: candidate == Capability::Timing,
            reason: "deadline follow-up is usually worth a look".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenv::dotenv().ok();

    info!("WealthMind orchestrator demo turn");

    // Canned findings per capability so the turn is fully offline
    let mut canned = HashMap::new();
    canned.insert(
        Capability::TaxImplications,
        vec![Finding {
            title: "Selling SHOP.TO realizes a capital loss".to_string(),
            dollar_impact: 534.0,
            impact_direction: ImpactDirection::Save,
            urgency: Urgency::ThisMonth,
            reasoning: "The position is down; the realized loss offsets gains.".to_string(),
            confidence: Confidence::High,
            what_to_do: "Harvest the loss before rebuying anything similar.".to_string(),
            domain: None,
            source: None,
        }],
    );
    canned.insert(
        Capability::Timing,
        vec![Finding {
            title: "RRSP deadline is approaching".to_string(),
            dollar_impact: 6235.0,
            impact_direction: ImpactDirection::Save,
            urgency: Urgency::Immediate,
            reasoning: "Contribution room is unused with the deadline near.".to_string(),
            confidence: Confidence::Medium,
            what_to_do: "Contribute before the deadline to claim the deduction.".to_string(),
            domain: None,
            source: None,
        }],
    );

    let client = Arc::new(wealthmind_orchestrator::claude::ClaudeClient::from_env());
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let session = sessions
        .create_today(
            Uuid::new_v4(),
            MessageRecord::assistant("Welcome.", vec![], FindingsMap::new()),
            FindingsMap::new(),
        )
        .await?;

    let orchestrator = TurnOrchestrator::new(
        Arc::new(LlmRouter::new(client)),
        Arc::new(CapabilityInvoker::new(Arc::new(
            StaticCapabilityRunner::new(canned),
        ))),
        Arc::new(OfflineEvaluator),
        Arc::new(OfflineSynthesizer),
        None,
        sessions,
        Arc::new(DemoSnapshotProvider),
        json!({ "tax_year": 2024 }),
    );

    let message = "Should I sell my SHOP.TO position?";
    println!("user> {}", message);

    let (tx, mut rx) = mpsc::channel(64);
    let session_id = session.session_id.clone();
    let handle = tokio::spawn(async move {
        orchestrator
            .run_turn(&session_id, message, EventSender::new(tx))
            .await;
    });

    while let Some(event) = rx.recv().await {
        println!("{:>22} | {}", event.name(), event.payload());
    }
    handle.await?;

    Ok(())
}
