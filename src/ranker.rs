//! Finding validation, merge, dedup and ranking
//!
//! This is the single merge path for every consumer: the chat turn, batch
//! analysis, the advisor report, the proactive greeting and what-if all go
//! through `merge_findings` so ranking behaves identically everywhere.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::models::{
    CapabilityResult, DeltaDirection, DeltaPresence, Finding, FindingDelta,
};

/// Parse raw capability output into valid findings. Entries failing the
/// validity invariant (missing fields, non-numeric dollar impact) are
/// logged and dropped, never surfaced and never an error.
pub fn validate_findings(domain: &str, raw: &[Value]) -> Vec<Finding> {
    raw.iter()
        .filter_map(|value| match Finding::from_value(value) {
            Some(mut finding) => {
                finding.domain = Some(domain.to_string());
                Some(finding)
            }
            None => {
                warn!(domain, "Skipping malformed finding: {}", value);
                None
            }
        })
        .collect()
}

/// Merge one or more capability results into a single ordered list:
/// flatten in merge order, dedupe by normalized title (first occurrence
/// wins, even when numeric fields differ), then stable-sort by dollar
/// impact descending. Stability is load-bearing: it is the only tie-break
/// rule.
pub fn merge_findings(results: &[CapabilityResult]) -> Vec<Finding> {
    let mut seen_titles: HashSet<String> = HashSet::new();
    let mut merged: Vec<Finding> = Vec::new();

    for result in results {
        for finding in &result.findings {
            let key = finding.title_key();
            if seen_titles.insert(key) {
                let mut finding = finding.clone();
                finding
                    .domain
                    .get_or_insert_with(|| result.capability.domain_key().to_string());
                merged.push(finding);
            }
        }
    }

    merged.sort_by(|a, b| {
        b.dollar_impact
            .partial_cmp(&a.dollar_impact)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

/// Side-by-side comparison of two finding sets by title, sorted by
/// absolute delta descending. Used by what-if analysis.
pub fn compare_findings(baseline: &[Finding], modified: &[Finding]) -> Vec<FindingDelta> {
    let baseline_by_title: HashMap<&str, &Finding> =
        baseline.iter().map(|f| (f.title.as_str(), f)).collect();
    let modified_by_title: HashMap<&str, &Finding> =
        modified.iter().map(|f| (f.title.as_str(), f)).collect();

    let mut titles: Vec<&str> = baseline_by_title
        .keys()
        .chain(modified_by_title.keys())
        .copied()
        .collect();
    titles.sort_unstable();
    titles.dedup();

    let mut deltas: Vec<FindingDelta> = titles
        .into_iter()
        .map(|title| {
            let base = baseline_by_title.get(title);
            let modif = modified_by_title.get(title);
            let base_impact = base.map(|f| f.dollar_impact).unwrap_or(0.0);
            let modif_impact = modif.map(|f| f.dollar_impact).unwrap_or(0.0);
            let delta = modif_impact - base_impact;

            let direction = if delta.abs() < 0.01 {
                DeltaDirection::Unchanged
            } else if delta > 0.0 {
                DeltaDirection::Improved
            } else {
                DeltaDirection::Worsened
            };

            let present_in = match (base, modif) {
                (Some(_), Some(_)) => DeltaPresence::Both,
                (Some(_), None) => DeltaPresence::BaselineOnly,
                _ => DeltaPresence::ModifiedOnly,
            };

            FindingDelta {
                title: title.to_string(),
                baseline_dollar_impact: round2(base_impact),
                modified_dollar_impact: round2(modif_impact),
                delta_dollar_impact: round2(delta),
                delta_pct: if base_impact != 0.0 {
                    round1(delta / base_impact * 100.0)
                } else {
                    0.0
                },
                direction,
                present_in,
            }
        })
        .collect();

    deltas.sort_by(|a, b| {
        b.delta_dollar_impact
            .abs()
            .partial_cmp(&a.delta_dollar_impact.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    deltas
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::models::{Confidence, ImpactDirection, Urgency};
    use serde_json::json;

    fn finding(title: &str, impact: f64) -> Finding {
        Finding {
            title: title.to_string(),
            dollar_impact: impact,
            impact_direction: ImpactDirection::Save,
            urgency: Urgency::Evergreen,
            reasoning: "r".to_string(),
            confidence: Confidence::Medium,
            what_to_do: "w".to_string(),
            domain: None,
            source: None,
        }
    }

    fn result(capability: Capability, findings: Vec<Finding>) -> CapabilityResult {
        CapabilityResult {
            capability,
            findings,
        }
    }

    #[test]
    fn test_invalid_findings_dropped_without_error() {
        let raw = vec![
            json!({
                "title": "Keep me",
                "dollar_impact": 10,
                "impact_direction": "save",
                "urgency": "evergreen",
                "reasoning": "r",
                "confidence": "high",
                "what_to_do": "w"
            }),
            // missing confidence
            json!({
                "title": "Drop me",
                "dollar_impact": 999,
                "impact_direction": "save",
                "urgency": "evergreen",
                "reasoning": "r",
                "what_to_do": "w"
            }),
        ];
        let findings = validate_findings("tax", &raw);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "Keep me");
        assert_eq!(findings[0].domain.as_deref(), Some("tax"));
    }

    #[test]
    fn test_dedup_is_case_and_whitespace_insensitive() {
        let merged = merge_findings(&[
            result(
                Capability::Allocation,
                vec![finding("Contribute to TFSA", 100.0)],
            ),
            result(
                Capability::Timing,
                vec![finding(" contribute to tfsa ", 900.0)],
            ),
        ]);
        assert_eq!(merged.len(), 1);
        // first occurrence in merge order wins, even with a bigger impact later
        assert_eq!(merged[0].title, "Contribute to TFSA");
        assert_eq!(merged[0].dollar_impact, 100.0);
    }

    #[test]
    fn test_rank_descending_with_stable_ties() {
        let merged = merge_findings(&[result(
            Capability::TaxImplications,
            vec![
                finding("first tie", 500.0),
                finding("small", 10.0),
                finding("second tie", 500.0),
                finding("big", 2000.0),
            ],
        )]);
        let titles: Vec<&str> = merged.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, vec!["big", "first tie", "second tie", "small"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let input = vec![
            result(
                Capability::Allocation,
                vec![finding("a", 50.0), finding("b", 50.0)],
            ),
            result(Capability::Timing, vec![finding("c", 75.0)]),
        ];
        let once = merge_findings(&input);
        let again = merge_findings(&input);
        assert_eq!(once, again);
    }

    #[test]
    fn test_delta_comparison() {
        let baseline = vec![finding("X", 100.0)];
        let modified = vec![finding("X", 150.0)];
        let deltas = compare_findings(&baseline, &modified);

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].delta_dollar_impact, 50.0);
        assert_eq!(deltas[0].direction, DeltaDirection::Improved);
        assert_eq!(deltas[0].present_in, DeltaPresence::Both);
        assert_eq!(deltas[0].delta_pct, 50.0);
    }

    #[test]
    fn test_delta_presence_tracking() {
        let baseline = vec![finding("gone", 40.0)];
        let modified = vec![finding("new", 60.0)];
        let deltas = compare_findings(&baseline, &modified);

        let gone = deltas.iter().find(|d| d.title == "gone").unwrap();
        let new = deltas.iter().find(|d| d.title == "new").unwrap();
        assert_eq!(gone.present_in, DeltaPresence::BaselineOnly);
        assert_eq!(gone.direction, DeltaDirection::Worsened);
        assert_eq!(new.present_in, DeltaPresence::ModifiedOnly);
        assert_eq!(new.direction, DeltaDirection::Improved);
    }
}
