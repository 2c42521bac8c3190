//! Trade interception
//!
//! Before a trade executes, runs the relevant capabilities against a
//! simulated post-trade snapshot and surfaces material findings. The
//! whole fan-out runs under a fixed deadline and every failure path
//! degrades to "do not intercept", so the trade flow is never blocked.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::capability::{Capability, CapabilityInvoker};
use crate::models::{Finding, Urgency};
use crate::ranker;
use crate::snapshot::{FinancialSnapshot, TradeAction};

const DEADLINE: Duration = Duration::from_secs(8);
const MATERIAL_THRESHOLD: f64 = 50.0;
const MAX_SURFACED: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertUrgency {
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterceptVerdict {
    pub should_intercept: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urgency: Option<AlertUrgency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub better_alternative: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proceed_anyway_label: Option<String>,
}

impl InterceptVerdict {
    fn pass() -> Self {
        Self {
            should_intercept: false,
            urgency: None,
            headline: None,
            findings: Vec::new(),
            better_alternative: None,
            proceed_anyway_label: None,
        }
    }
}

/// Minimal capability set relevant to this trade.
fn select_capabilities(
    snapshot: &FinancialSnapshot,
    account_id: i64,
    ticker: &str,
    action: TradeAction,
) -> Vec<Capability> {
    // every trade has tax implications
    let mut capabilities = vec![Capability::TaxImplications];

    let Some(account) = snapshot.account(account_id) else {
        return capabilities;
    };

    if action == TradeAction::Sell {
        let has_gain = account
            .positions
            .iter()
            .find(|p| p.ticker.eq_ignore_ascii_case(ticker))
            .map(|p| p.unrealized_gain_loss_cad > 0.0)
            .unwrap_or(false);
        let any_losses = snapshot
            .positions()
            .any(|(p, _)| p.unrealized_gain_loss_cad < 0.0);
        if has_gain && any_losses {
            capabilities.push(Capability::LossHarvesting);
        }
    }

    if matches!(account.account_type.as_str(), "rrsp" | "tfsa" | "fhsa") {
        capabilities.push(Capability::Allocation);
    }

    if action == TradeAction::Buy {
        capabilities.push(Capability::RateArbitrage);
    }

    capabilities
}

/// Simulate the trade and decide whether to interrupt it. Completes within
/// the deadline or returns a pass-through verdict.
pub async fn intercept_trade(
    invoker: &CapabilityInvoker,
    snapshot: &FinancialSnapshot,
    account_id: i64,
    ticker: &str,
    shares: f64,
    action: TradeAction,
    ruleset: &Value,
) -> InterceptVerdict {
    let simulated = snapshot.with_trade(account_id, ticker, shares, action);
    let capabilities = select_capabilities(snapshot, account_id, ticker, action);

    info!(
        ?capabilities,
        ticker, shares, "Running pre-trade interception"
    );

    let outcomes = invoker
        .run_group_within(DEADLINE, &capabilities, &simulated, ruleset)
        .await;

    let results: Vec<_> = outcomes.iter().map(|o| o.result()).collect();
    let merged = ranker::merge_findings(&results);

    let mut material: Vec<Finding> = merged
        .into_iter()
        .filter(|f| f.dollar_impact.abs() >= MATERIAL_THRESHOLD)
        .collect();

    if material.is_empty() {
        warn!(ticker, "No material findings; not intercepting");
        return InterceptVerdict::pass();
    }

    material.sort_by(|a, b| {
        b.dollar_impact
            .abs()
            .partial_cmp(&a.dollar_impact.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let top = material[0].clone();

    let urgency = match top.urgency {
        Urgency::Immediate | Urgency::ThisMonth => AlertUrgency::Warning,
        Urgency::Evergreen => AlertUrgency::Info,
    };

    let mut headline = top.title.clone();
    if top.dollar_impact != 0.0 && !headline.ends_with('.') {
        headline = format!(
            "{} — ${:.0} {} at stake.",
            headline, top.dollar_impact, top.impact_direction
        );
    }

    // a harvesting finding, when present, is the better alternative
    let better_alternative = material
        .iter()
        .find(|f| {
            let haystack = format!("{} {}", f.title, f.what_to_do).to_lowercase();
            ["harvest", "loss", "tlh", "offset"]
                .iter()
                .any(|kw| haystack.contains(kw))
        })
        .map(|f| f.what_to_do.clone());

    let action_label = match action {
        TradeAction::Sell => "Sell",
        TradeAction::Buy => "Buy",
    };

    material.truncate(MAX_SURFACED);

    InterceptVerdict {
        should_intercept: true,
        urgency: Some(urgency),
        headline: Some(headline),
        findings: material,
        better_alternative,
        proceed_anyway_label: Some(format!("{} {} anyway", action_label, ticker.to_uppercase())),
    }
}
