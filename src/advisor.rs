//! Batch analysis, proactive greeting and the advisor report
//!
//! All three run every capability against the live snapshot and merge
//! through the same ranker as the chat path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::capability::{Capability, CapabilityInvoker};
use crate::models::{Finding, ImpactDirection};
use crate::ranker;
use crate::snapshot::FinancialSnapshot;
use crate::synthesizer::Synthesizer;

const CACHE_MINUTES: i64 = 10;
const TOP_GREETING_FINDINGS: usize = 3;
const TOP_OPPORTUNITY_FINDINGS: usize = 5;

/// Run every capability concurrently and merge. Returns the ranked
/// findings (tagged with their producing capability) and the names of the
/// capabilities that produced at least one.
pub async fn run_full_analysis(
    invoker: &CapabilityInvoker,
    snapshot: &FinancialSnapshot,
    ruleset: &Value,
) -> (Vec<Finding>, Vec<String>) {
    let outcomes = invoker
        .run_group(Capability::all(), snapshot, ruleset)
        .await;

    let mut sources: Vec<String> = Vec::new();
    let results: Vec<_> = outcomes
        .iter()
        .map(|outcome| {
            if !outcome.findings.is_empty() {
                sources.push(outcome.capability.name().to_string());
            }
            let mut result = outcome.result();
            for finding in result.findings.iter_mut() {
                finding.source = Some(outcome.capability.name().to_string());
            }
            result
        })
        .collect();

    (ranker::merge_findings(&results), sources)
}

//
// ================= Proactive greeting =================
//

#[derive(Debug, Clone, Serialize)]
pub struct Greeting {
    pub message: String,
    pub top_findings: Vec<Finding>,
    pub agent_sources: Vec<String>,
}

/// Session-opening greeting: top findings by dollar impact plus a
/// synthesized welcome line.
pub async fn generate_greeting(
    invoker: &CapabilityInvoker,
    synthesizer: &Arc<dyn Synthesizer>,
    snapshot: &FinancialSnapshot,
    ruleset: &Value,
) -> Greeting {
    let (mut findings, agent_sources) = run_full_analysis(invoker, snapshot, ruleset).await;
    findings.truncate(TOP_GREETING_FINDINGS);

    let message = synthesizer.synthesize_greeting(&findings, snapshot).await;

    Greeting {
        message,
        top_findings: findings,
        agent_sources,
    }
}

//
// ================= Advisor report =================
//

#[derive(Debug, Clone, Serialize)]
pub struct AdvisorReport {
    pub headline: String,
    pub full_picture: String,
    pub do_not_do: String,
    pub total_opportunity: i64,
    pub chips: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub cached: bool,
}

pub struct AdvisorService {
    invoker: Arc<CapabilityInvoker>,
    synthesizer: Arc<dyn Synthesizer>,
    cache: Mutex<Option<AdvisorReport>>,
}

impl AdvisorService {
    pub fn new(invoker: Arc<CapabilityInvoker>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            invoker,
            synthesizer,
            cache: Mutex::new(None),
        }
    }

    pub async fn report(&self, snapshot: &FinancialSnapshot, ruleset: &Value) -> AdvisorReport {
        {
            let cache = self.cache.lock().await;
            if let Some(report) = cache.as_ref() {
                let age = Utc::now().signed_duration_since(report.generated_at);
                if age.num_minutes() < CACHE_MINUTES {
                    info!("Serving cached advisor report");
                    let mut cached = report.clone();
                    cached.cached = true;
                    return cached;
                }
            }
        }

        let (findings, _) = run_full_analysis(&self.invoker, snapshot, ruleset).await;

        let headline = findings
            .first()
            .map(|f| format!("{} (${:.0})", f.title, f.dollar_impact))
            .unwrap_or_else(|| "No material opportunities right now.".to_string());

        let full_picture = self
            .synthesizer
            .synthesize_response(
                "Give me the full picture of my finances.",
                &json!({ "findings": findings }),
                &[],
            )
            .await;

        let do_not_do = findings
            .iter()
            .find(|f| f.impact_direction == ImpactDirection::Avoid)
            .map(|f| f.what_to_do.clone())
            .unwrap_or_else(|| {
                "Don't make any large moves before checking the tax angle.".to_string()
            });

        let total_opportunity: i64 = findings
            .iter()
            .take(TOP_OPPORTUNITY_FINDINGS)
            .map(|f| f.dollar_impact)
            .sum::<f64>() as i64;

        let chips = self
            .synthesizer
            .generate_follow_ups(
                "Advisor report",
                &full_picture,
                &json!({ "findings": findings }),
            )
            .await;

        let report = AdvisorReport {
            headline,
            full_picture,
            do_not_do,
            total_opportunity,
            chips,
            generated_at: Utc::now(),
            cached: false,
        };

        let mut cache = self.cache.lock().await;
        *cache = Some(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StaticCapabilityRunner;
    use crate::models::{Confidence, MessageRecord, Urgency};
    use crate::snapshot::demo_snapshot;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

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

    struct CannedSynthesizer;

    #[async_trait]
    impl Synthesizer for CannedSynthesizer {
        async fn synthesize_response(
            &self,
            _message: &str,
            _findings: &Value,
            _history: &[MessageRecord],
        ) -> String {
            "the full picture".to_string()
        }

        async fn generate_follow_ups(
            &self,
            _message: &str,
            _response: &str,
            _findings: &Value,
        ) -> Vec<String> {
            vec![]
        }

        async fn synthesize_greeting(
            &self,
            top_findings: &[Finding],
            _snapshot: &FinancialSnapshot,
        ) -> String {
            format!("welcome, {} things to look at", top_findings.len())
        }
    }

    fn invoker_with(canned: HashMap<Capability, Vec<Finding>>) -> Arc<CapabilityInvoker> {
        Arc::new(CapabilityInvoker::new(Arc::new(
            StaticCapabilityRunner::new(canned),
        )))
    }

    #[tokio::test]
    async fn test_full_analysis_tags_sources() {
        let mut canned = HashMap::new();
        canned.insert(Capability::Allocation, vec![finding("room", 800.0)]);
        canned.insert(Capability::Timing, vec![finding("deadline", 1200.0)]);
        let invoker = invoker_with(canned);

        let (findings, sources) =
            run_full_analysis(&invoker, &demo_snapshot(), &json!({})).await;

        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].title, "deadline");
        assert_eq!(findings[0].source.as_deref(), Some("timing"));
        assert_eq!(
            sources,
            vec!["allocation".to_string(), "timing".to_string()]
        );
    }

    #[tokio::test]
    async fn test_greeting_takes_top_three() {
        let mut canned = HashMap::new();
        canned.insert(
            Capability::Allocation,
            vec![
                finding("a", 100.0),
                finding("b", 400.0),
                finding("c", 300.0),
                finding("d", 200.0),
            ],
        );
        let invoker = invoker_with(canned);
        let synthesizer: Arc<dyn Synthesizer> = Arc::new(CannedSynthesizer);

        let greeting =
            generate_greeting(&invoker, &synthesizer, &demo_snapshot(), &json!({})).await;

        assert_eq!(greeting.top_findings.len(), 3);
        assert_eq!(greeting.top_findings[0].title, "b");
        assert_eq!(greeting.message, "welcome, 3 things to look at");
    }

    #[tokio::test]
    async fn test_report_is_cached_within_window() {
        let mut canned = HashMap::new();
        canned.insert(Capability::Allocation, vec![finding("room", 800.0)]);
        let service = AdvisorService::new(invoker_with(canned), Arc::new(CannedSynthesizer));

        let first = service.report(&demo_snapshot(), &json!({})).await;
        assert!(!first.cached);
        assert_eq!(first.total_opportunity, 800);
        assert!(first.headline.contains("room"));

        let second = service.report(&demo_snapshot(), &json!({})).await;
        assert!(second.cached);
        assert_eq!(second.generated_at, first.generated_at);
    }
}
