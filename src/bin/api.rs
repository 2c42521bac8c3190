use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use wealthmind_orchestrator::advisor::AdvisorService;
use wealthmind_orchestrator::api::{self, ApiState};
use wealthmind_orchestrator::capability::LlmCapabilityRunner;
use wealthmind_orchestrator::claude::ClaudeClient;
use wealthmind_orchestrator::monitor::{AlertStore, CooldownTracker, PortfolioMonitor};
use wealthmind_orchestrator::referral::LlmReferralEvaluator;
use wealthmind_orchestrator::router::LlmRouter;
use wealthmind_orchestrator::search::HttpContextSearch;
use wealthmind_orchestrator::session;
use wealthmind_orchestrator::snapshot::{DemoSnapshotProvider, SnapshotProvider};
use wealthmind_orchestrator::synthesizer::{LlmSynthesizer, Synthesizer};
use wealthmind_orchestrator::{CapabilityInvoker, TurnOrchestrator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        eprintln!("ANTHROPIC_API_KEY not set; model-backed calls will fail open/closed per policy");
    }

    let port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("WealthMind orchestrator API server");
    info!("Port: {}", port);

    // Shared components
    let client = Arc::new(ClaudeClient::from_env());
    let invoker = Arc::new(CapabilityInvoker::new(Arc::new(
        LlmCapabilityRunner::new(Arc::clone(&client)),
    )));
    let synthesizer: Arc<dyn Synthesizer> =
        Arc::new(LlmSynthesizer::new(Arc::clone(&client)));
    let snapshots: Arc<dyn SnapshotProvider> = Arc::new(DemoSnapshotProvider);
    let sessions = session::store_from_env();
    let ruleset = api::load_ruleset();
    let demo_user = api::stable_uuid_from_string("demo-user");

    let search = HttpContextSearch::from_env().map(|s| {
        info!("Context search enabled");
        Arc::new(s) as Arc<dyn wealthmind_orchestrator::search::ContextSearch>
    });

    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::new(LlmRouter::new(Arc::clone(&client))),
        Arc::clone(&invoker),
        Arc::new(LlmReferralEvaluator::new(Arc::clone(&client))),
        Arc::clone(&synthesizer),
        search,
        sessions,
        Arc::clone(&snapshots),
        ruleset.clone(),
    ));

    let advisor = Arc::new(AdvisorService::new(
        Arc::clone(&invoker),
        Arc::clone(&synthesizer),
    ));

    // Background portfolio monitor
    let alerts = Arc::new(AlertStore::new());
    let monitor = Arc::new(
        PortfolioMonitor::new(
            Arc::clone(&snapshots),
            demo_user,
            Arc::new(CooldownTracker::new()),
            Arc::clone(&alerts),
        )
        .with_timing(Duration::from_secs(300), Duration::from_secs(30)),
    );
    let _monitor_task = monitor.start();
    info!("Portfolio monitor started");

    let state = ApiState {
        orchestrator,
        invoker,
        synthesizer,
        snapshots,
        advisor,
        alerts,
        ruleset,
        demo_user,
    };

    info!("Orchestrator initialized; starting API server");
    api::start_server(state, port).await?;

    Ok(())
}
