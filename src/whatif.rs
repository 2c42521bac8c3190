//! What-if scenario analysis
//!
//! Runs the scenario-relevant capabilities against both the baseline
//! snapshot and a hypothetically-modified copy, then compares the two
//! finding sets side by side. The capabilities never see a mutation
//! instruction, only a snapshot.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{Capability, CapabilityInvoker, CapabilityOutcome};
use crate::models::{Finding, FindingDelta};
use crate::ranker;
use crate::snapshot::{FinancialSnapshot, TradeAction};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WhatIfScenario {
    RrspContribution,
    TfsaContribution,
    PayMargin,
    SellPosition,
}

impl WhatIfScenario {
    /// Capabilities worth re-running for this scenario.
    pub const fn capabilities(self) -> &'static [Capability] {
        match self {
            WhatIfScenario::RrspContribution => {
                &[Capability::Allocation, Capability::Timing]
            }
            WhatIfScenario::TfsaContribution => &[Capability::Allocation],
            WhatIfScenario::PayMargin => &[Capability::RateArbitrage],
            WhatIfScenario::SellPosition => {
                &[Capability::TaxImplications, Capability::LossHarvesting]
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatIfParameters {
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub shares: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhatIfReport {
    pub scenario: WhatIfScenario,
    pub capabilities_run: Vec<Capability>,
    pub baseline_findings: Vec<Finding>,
    pub modified_findings: Vec<Finding>,
    pub delta: Vec<FindingDelta>,
}

/// Apply a scenario to the baseline, producing a new snapshot.
pub fn apply_scenario(
    baseline: &FinancialSnapshot,
    scenario: WhatIfScenario,
    params: &WhatIfParameters,
) -> FinancialSnapshot {
    match scenario {
        WhatIfScenario::RrspContribution => baseline.with_contribution("rrsp", params.amount),
        WhatIfScenario::TfsaContribution => baseline.with_contribution("tfsa", params.amount),
        WhatIfScenario::PayMargin => baseline.with_margin_paydown(params.amount),
        WhatIfScenario::SellPosition => match (&params.ticker, params.account_id) {
            (Some(ticker), Some(account_id)) => baseline.with_trade(
                account_id,
                ticker,
                params.shares.unwrap_or(0.0),
                TradeAction::Sell,
            ),
            _ => baseline.clone(),
        },
    }
}

/// Run the scenario's capabilities against baseline and modified snapshots
/// in parallel and produce the delta table.
pub async fn run_what_if(
    invoker: &CapabilityInvoker,
    baseline: &FinancialSnapshot,
    scenario: WhatIfScenario,
    params: &WhatIfParameters,
    ruleset: &Value,
) -> WhatIfReport {
    let modified = apply_scenario(baseline, scenario, params);
    let capabilities = scenario.capabilities();

    let runs = join_all([
        invoker.run_group(capabilities, baseline, ruleset),
        invoker.run_group(capabilities, &modified, ruleset),
    ])
    .await;
    let mut runs = runs.into_iter();
    let baseline_findings = collect(runs.next().unwrap_or_default());
    let modified_findings = collect(runs.next().unwrap_or_default());

    let delta = ranker::compare_findings(&baseline_findings, &modified_findings);

    WhatIfReport {
        scenario,
        capabilities_run: capabilities.to_vec(),
        baseline_findings,
        modified_findings,
        delta,
    }
}

fn collect(outcomes: Vec<CapabilityOutcome>) -> Vec<Finding> {
    let results: Vec<_> = outcomes.iter().map(|o| o.result()).collect();
    ranker::merge_findings(&results)
}
