//! Autonomous portfolio monitor
//!
//! Periodically evaluates threshold, price and opportunity triggers over
//! consecutive snapshots and records alerts. The cooldown map is an
//! explicit injectable component (a keyed last-fired store) rather than a
//! process global, so it can be reset between test runs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::snapshot::{FinancialSnapshot, SnapshotProvider};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(30);

//
// ================= Cooldown tracker =================
//

/// Keyed last-fired timestamps guarding alert re-emission.
#[derive(Default)]
pub struct CooldownTracker {
    fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(alert_type: &str, ticker: Option<&str>) -> String {
        format!("{}:{}", alert_type, ticker.unwrap_or("*"))
    }

    pub fn is_cooled(&self, key: &str, hours: f64) -> bool {
        let fired = self.fired.lock().expect("cooldown lock poisoned");
        match fired.get(key) {
            None => true,
            Some(ts) => {
                let elapsed = Utc::now().signed_duration_since(*ts);
                elapsed.num_seconds() as f64 >= hours * 3600.0
            }
        }
    }

    pub fn arm(&self, key: &str) {
        let mut fired = self.fired.lock().expect("cooldown lock poisoned");
        fired.insert(key.to_string(), Utc::now());
    }

    pub fn reset(&self) {
        self.fired.lock().expect("cooldown lock poisoned").clear();
    }
}

//
// ================= Alerts =================
//

#[derive(Debug, Clone, Serialize)]
pub struct MonitorAlert {
    pub alert_type: String,
    pub message: String,
    pub ticker: Option<String>,
    pub dollar_impact: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// In-memory alert queue drained by the API layer.
#[derive(Default)]
pub struct AlertStore {
    pending: Mutex<Vec<MonitorAlert>>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, alert: MonitorAlert) {
        self.pending.lock().expect("alert lock poisoned").push(alert);
    }

    /// Pending alerts, newest first; draining marks them surfaced.
    pub fn drain_pending(&self) -> Vec<MonitorAlert> {
        let mut pending = self.pending.lock().expect("alert lock poisoned");
        let mut drained: Vec<MonitorAlert> = pending.drain(..).collect();
        drained.reverse();
        drained
    }
}

//
// ================= Trigger evaluation =================

struct Draft {
    alert_type: &'static str,
    message: String,
    ticker: Option<String>,
    dollar_impact: Option<f64>,
    cooldown_hours: f64,
}

/// Evaluate all triggers against the current snapshot (and the previous
/// one, for change-based triggers). Cooldown-guarded: a fired trigger arms
/// its key.
pub fn evaluate_triggers(
    current: &FinancialSnapshot,
    last: Option<&FinancialSnapshot>,
    cooldowns: &CooldownTracker,
    today: NaiveDate,
) -> Vec<MonitorAlert> {
    let mut drafts: Vec<Draft> = Vec::new();

    // ── price triggers (need a previous snapshot) ─────────────────────
    if let Some(last) = last {
        let last_positions: HashMap<&str, f64> = last
            .positions()
            .map(|(p, _)| (p.ticker.as_str(), p.current_price))
            .collect();

        for (pos, _) in current.positions() {
            let Some(&last_price) = last_positions.get(pos.ticker.as_str()) else {
                continue;
            };
            if last_price <= 0.0 {
                continue;
            }
            let change_pct = (pos.current_price - last_price) / last_price * 100.0;
            let unrealized = pos.unrealized_gain_loss_cad;

            if change_pct <= -5.0 {
                let label = if unrealized < 0.0 { "loss" } else { "gain" };
                drafts.push(Draft {
                    alert_type: "price_drop",
                    message: format!(
                        "{} is down {:.1}% — your unrealized {} is now ${:.0}. \
                         That changes the harvesting math.",
                        pos.ticker,
                        change_pct.abs(),
                        label,
                        unrealized.abs()
                    ),
                    ticker: Some(pos.ticker.clone()),
                    dollar_impact: Some(unrealized.abs()),
                    cooldown_hours: 4.0,
                });
            } else if change_pct >= 10.0 {
                drafts.push(Draft {
                    alert_type: "price_gain",
                    message: format!(
                        "{} is up {:.1}% — your unrealized gain is now ${:.0}. \
                         Worth knowing before you make any moves.",
                        pos.ticker, change_pct, unrealized
                    ),
                    ticker: Some(pos.ticker.clone()),
                    dollar_impact: Some(unrealized),
                    cooldown_hours: 4.0,
                });
            }
        }

        // ── newly-opened harvesting windows ──────────────────────────
        let last_unrealized: HashMap<&str, f64> = last
            .positions()
            .map(|(p, _)| (p.ticker.as_str(), p.unrealized_gain_loss_cad))
            .collect();
        for (pos, _) in current.positions() {
            if pos.unrealized_gain_loss_cad >= -200.0 {
                continue;
            }
            let was_above = last_unrealized
                .get(pos.ticker.as_str())
                .map(|&v| v > -200.0)
                .unwrap_or(false);
            if was_above {
                drafts.push(Draft {
                    alert_type: "tlh_window",
                    message: format!(
                        "A new harvesting window just opened on {} — ${:.0} loss you \
                         could use to offset gains.",
                        pos.ticker,
                        pos.unrealized_gain_loss_cad.abs()
                    ),
                    ticker: Some(pos.ticker.clone()),
                    dollar_impact: Some(pos.unrealized_gain_loss_cad.abs()),
                    cooldown_hours: 24.0,
                });
            }
        }

        // ── portfolio drawdown ───────────────────────────────────────
        if last.total_value_cad > 0.0 {
            let change = (current.total_value_cad - last.total_value_cad)
                / last.total_value_cad
                * 100.0;
            if change <= -3.0 {
                let loss = last.total_value_cad - current.total_value_cad;
                drafts.push(Draft {
                    alert_type: "portfolio_down",
                    message: format!(
                        "Your portfolio is down {:.1}% since last check — ${:.0} in \
                         unrealized losses.",
                        change.abs(),
                        loss
                    ),
                    ticker: None,
                    dollar_impact: Some(loss),
                    cooldown_hours: 24.0,
                });
            }
        }
    }

    // ── margin interest threshold ─────────────────────────────────────
    if let Some(margin) = &current.margin {
        if margin.annual_cost > 500.0 {
            let quarterly = (margin.annual_cost / 4.0).round();
            drafts.push(Draft {
                alert_type: "margin_interest",
                message: format!(
                    "Your margin debt has now cost you ${:.0} in interest this \
                     quarter. At ${:.0}/year, that's eroding your returns.",
                    quarterly, margin.annual_cost
                ),
                ticker: None,
                dollar_impact: Some(quarterly),
                cooldown_hours: 7.0 * 24.0,
            });
        }
    }

    // ── RRSP deadline within a week ───────────────────────────────────
    for acct in &current.accounts {
        if acct.account_type != "rrsp" {
            continue;
        }
        let Some(deadline) = acct.contribution_deadline else {
            continue;
        };
        let days_left = (deadline - today).num_days();
        if (0..=7).contains(&days_left) {
            let room = acct.contribution_room_remaining.unwrap_or(0.0);
            let day_word = if days_left == 1 { "day" } else { "days" };
            let message = if room > 0.0 {
                format!(
                    "RRSP deadline is {} {} away. You still have ${:.0} in \
                     contribution room.",
                    days_left, day_word, room
                )
            } else {
                format!("RRSP deadline is {} {} away.", days_left, day_word)
            };
            drafts.push(Draft {
                alert_type: "rrsp_deadline",
                message,
                ticker: None,
                dollar_impact: Some(room),
                cooldown_hours: 24.0,
            });
        }
    }

    // ── FHSA never opened ─────────────────────────────────────────────
    if let Some(fhsa) = current
        .accounts
        .iter()
        .find(|a| a.account_type == "fhsa" && !a.is_active)
    {
        let room = fhsa.contribution_room_remaining.unwrap_or(8_000.0);
        drafts.push(Draft {
            alert_type: "fhsa",
            message: format!(
                "You haven't opened your FHSA yet. You're leaving ${:.0} in \
                 tax-free contribution room on the table.",
                room
            ),
            ticker: None,
            dollar_impact: Some(room),
            cooldown_hours: 7.0 * 24.0,
        });
    }

    drafts
        .into_iter()
        .filter_map(|draft| {
            let key = CooldownTracker::key(draft.alert_type, draft.ticker.as_deref());
            if !cooldowns.is_cooled(&key, draft.cooldown_hours) {
                return None;
            }
            cooldowns.arm(&key);
            Some(MonitorAlert {
                alert_type: draft.alert_type.to_string(),
                message: draft.message,
                ticker: draft.ticker,
                dollar_impact: draft.dollar_impact,
                created_at: Utc::now(),
            })
        })
        .collect()
}

//
// ================= Background task =================
//

pub struct PortfolioMonitor {
    provider: Arc<dyn SnapshotProvider>,
    user_id: Uuid,
    cooldowns: Arc<CooldownTracker>,
    alerts: Arc<AlertStore>,
    interval: Duration,
    startup_delay: Duration,
    last_snapshot: Mutex<Option<FinancialSnapshot>>,
}

impl PortfolioMonitor {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        user_id: Uuid,
        cooldowns: Arc<CooldownTracker>,
        alerts: Arc<AlertStore>,
    ) -> Self {
        Self {
            provider,
            user_id,
            cooldowns,
            alerts,
            interval: DEFAULT_INTERVAL,
            startup_delay: DEFAULT_STARTUP_DELAY,
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn with_timing(mut self, interval: Duration, startup_delay: Duration) -> Self {
        self.interval = interval;
        self.startup_delay = startup_delay;
        self
    }

    /// One evaluation pass; also the unit the loop runs.
    pub async fn check(&self) -> crate::Result<usize> {
        let current = self.provider.snapshot(self.user_id).await?;
        let today = Utc::now().date_naive();

        let last = self
            .last_snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .clone();
        let alerts = evaluate_triggers(&current, last.as_ref(), &self.cooldowns, today);
        let count = alerts.len();
        for alert in alerts {
            info!(alert_type = %alert.alert_type, "Monitor alert: {}", alert.message);
            self.alerts.push(alert);
        }

        *self
            .last_snapshot
            .lock()
            .expect("snapshot lock poisoned") = Some(current);
        Ok(count)
    }

    /// Spawn the watch loop. Let the app finish starting before the first
    /// check.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.startup_delay).await;
            loop {
                if let Err(e) = self.check().await {
                    error!("Monitor check failed: {}", e);
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::demo_snapshot;

    #[test]
    fn test_cooldown_arm_and_reset() {
        let cooldowns = CooldownTracker::new();
        let key = CooldownTracker::key("price_drop", Some("SHOP.TO"));

        assert!(cooldowns.is_cooled(&key, 4.0));
        cooldowns.arm(&key);
        assert!(!cooldowns.is_cooled(&key, 4.0));
        // zero-hour window means immediately cooled again
        assert!(cooldowns.is_cooled(&key, 0.0));

        cooldowns.reset();
        assert!(cooldowns.is_cooled(&key, 4.0));
    }

    #[test]
    fn test_price_drop_fires_once_per_cooldown() {
        let cooldowns = CooldownTracker::new();
        let last = demo_snapshot();
        let mut current = demo_snapshot();
        for acct in current.accounts.iter_mut() {
            for pos in acct.positions.iter_mut() {
                if pos.ticker == "SHOP.TO" {
                    pos.current_price *= 0.9;
                }
            }
        }
        current.recompute_totals();
        let today = Utc::now().date_naive();

        let first = evaluate_triggers(&current, Some(&last), &cooldowns, today);
        assert!(first.iter().any(|a| a.alert_type == "price_drop"));

        let second = evaluate_triggers(&current, Some(&last), &cooldowns, today);
        assert!(!second.iter().any(|a| a.alert_type == "price_drop"));
    }

    #[test]
    fn test_rrsp_deadline_window() {
        let cooldowns = CooldownTracker::new();
        let snapshot = demo_snapshot();
        let deadline = snapshot
            .accounts
            .iter()
            .find(|a| a.account_type == "rrsp")
            .and_then(|a| a.contribution_deadline)
            .unwrap();

        // five days out: fires
        let alerts = evaluate_triggers(
            &snapshot,
            None,
            &cooldowns,
            deadline - chrono::Duration::days(5),
        );
        assert!(alerts.iter().any(|a| a.alert_type == "rrsp_deadline"));

        cooldowns.reset();
        // a month out: silent
        let alerts = evaluate_triggers(
            &snapshot,
            None,
            &cooldowns,
            deadline - chrono::Duration::days(30),
        );
        assert!(!alerts.iter().any(|a| a.alert_type == "rrsp_deadline"));
    }

    #[test]
    fn test_inactive_fhsa_and_margin_triggers() {
        let cooldowns = CooldownTracker::new();
        let snapshot = demo_snapshot();
        let alerts =
            evaluate_triggers(&snapshot, None, &cooldowns, Utc::now().date_naive());

        assert!(alerts.iter().any(|a| a.alert_type == "fhsa"));
        assert!(alerts.iter().any(|a| a.alert_type == "margin_interest"));
    }

    #[test]
    fn test_alert_store_drains_once() {
        let store = AlertStore::new();
        store.push(MonitorAlert {
            alert_type: "fhsa".to_string(),
            message: "open it".to_string(),
            ticker: None,
            dollar_impact: None,
            created_at: Utc::now(),
        });
        assert_eq!(store.drain_pending().len(), 1);
        assert!(store.drain_pending().is_empty());
    }
}
