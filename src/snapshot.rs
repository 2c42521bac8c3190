//! Financial-state snapshots
//!
//! A snapshot is an immutable point-in-time view of a user's accounts and
//! positions. Capabilities only ever see a snapshot, never a mutation
//! instruction: what-if scenarios and simulated trades produce new values.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub ticker: String,
    pub name: String,
    pub shares: f64,
    pub avg_cost_cad: f64,
    pub current_price: f64,
    pub current_value_cad: f64,
    pub unrealized_gain_loss_cad: f64,
}

impl Position {
    fn recompute(&mut self) {
        self.current_value_cad = round2(self.shares * self.current_price);
        self.unrealized_gain_loss_cad =
            round2(self.shares * (self.current_price - self.avg_cost_cad));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: i64,
    pub account_type: String,
    pub product_name: String,
    pub balance_cad: f64,
    pub interest_rate: Option<f64>,
    pub contribution_room_remaining: Option<f64>,
    pub contribution_deadline: Option<NaiveDate>,
    pub is_active: bool,
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarginSummary {
    pub debit_balance: f64,
    pub interest_rate: f64,
    pub annual_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialSnapshot {
    pub accounts: Vec<Account>,
    pub contribution_room: HashMap<String, f64>,
    pub margin: Option<MarginSummary>,
    pub total_value_cad: f64,
    pub total_gain_loss_cad: f64,
}

impl FinancialSnapshot {
    /// All positions across accounts, paired with their account type.
    pub fn positions(&self) -> impl Iterator<Item = (&Position, &str)> {
        self.accounts.iter().flat_map(|acct| {
            acct.positions
                .iter()
                .map(move |pos| (pos, acct.account_type.as_str()))
        })
    }

    pub fn account(&self, account_id: i64) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == account_id)
    }

    pub fn recompute_totals(&mut self) {
        let position_value: f64 = self
            .accounts
            .iter()
            .flat_map(|a| a.positions.iter())
            .map(|p| p.current_value_cad)
            .sum();
        let cash: f64 = self.accounts.iter().map(|a| a.balance_cad).sum();
        self.total_value_cad = round2(position_value + cash);
        self.total_gain_loss_cad = round2(
            self.accounts
                .iter()
                .flat_map(|a| a.positions.iter())
                .map(|p| p.unrealized_gain_loss_cad)
                .sum(),
        );
    }

    /// New snapshot with `amount` contributed to every account of the given
    /// registered type, shrinking its remaining room.
    pub fn with_contribution(&self, account_type: &str, amount: f64) -> FinancialSnapshot {
        let mut modified = self.clone();
        for acct in modified
            .accounts
            .iter_mut()
            .filter(|a| a.account_type == account_type)
        {
            let room = acct.contribution_room_remaining.unwrap_or(0.0);
            acct.contribution_room_remaining = Some((room - amount).max(0.0));
            acct.balance_cad += amount;
        }
        if let Some(room) = modified.contribution_room.get_mut(account_type) {
            *room = (*room - amount).max(0.0);
        }
        modified.recompute_totals();
        modified
    }

    /// New snapshot with `amount` paid against the margin debit.
    pub fn with_margin_paydown(&self, amount: f64) -> FinancialSnapshot {
        let mut modified = self.clone();
        for acct in modified
            .accounts
            .iter_mut()
            .filter(|a| a.account_type == "margin")
        {
            let debit = acct.balance_cad.abs();
            acct.balance_cad = -((debit - amount).max(0.0));
        }
        if let Some(margin) = modified.margin.as_mut() {
            margin.debit_balance = (margin.debit_balance - amount).max(0.0);
            margin.annual_cost = round2(margin.debit_balance * margin.interest_rate);
        }
        modified.recompute_totals();
        modified
    }

    /// New snapshot with a hypothetical trade applied to one account.
    /// Returns the snapshot unchanged when the account or a price for the
    /// ticker cannot be found; the caller gets a valid view either way.
    pub fn with_trade(
        &self,
        account_id: i64,
        ticker: &str,
        shares: f64,
        action: TradeAction,
    ) -> FinancialSnapshot {
        let mut modified = self.clone();
        let ticker_upper = ticker.to_uppercase();

        let Some(acct) = modified.accounts.iter_mut().find(|a| a.id == account_id) else {
            return modified;
        };
        let Some(price) = acct
            .positions
            .iter()
            .find(|p| p.ticker.eq_ignore_ascii_case(&ticker_upper))
            .map(|p| p.current_price)
        else {
            return modified;
        };
        let trade_value = round2(shares * price);

        match action {
            TradeAction::Sell => {
                acct.positions.retain_mut(|pos| {
                    if !pos.ticker.eq_ignore_ascii_case(&ticker_upper) {
                        return true;
                    }
                    let remaining = pos.shares - shares;
                    if remaining > 1e-4 {
                        pos.shares = remaining;
                        pos.recompute();
                        true
                    } else {
                        // position fully sold
                        false
                    }
                });
                acct.balance_cad = round2(acct.balance_cad + trade_value);
            }
            TradeAction::Buy => {
                if let Some(pos) = acct
                    .positions
                    .iter_mut()
                    .find(|p| p.ticker.eq_ignore_ascii_case(&ticker_upper))
                {
                    let old_cost = pos.shares * pos.avg_cost_cad;
                    pos.shares += shares;
                    pos.avg_cost_cad = (old_cost + trade_value) / pos.shares;
                    pos.recompute();
                } else {
                    let mut pos = Position {
                        ticker: ticker_upper.clone(),
                        name: ticker_upper.clone(),
                        shares,
                        avg_cost_cad: price,
                        current_price: price,
                        current_value_cad: 0.0,
                        unrealized_gain_loss_cad: 0.0,
                    };
                    pos.recompute();
                    acct.positions.push(pos);
                }
                acct.balance_cad = round2(acct.balance_cad - trade_value);
            }
        }

        modified.recompute_totals();
        modified
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

//
// ================= Provider boundary =================
//

/// Source of live snapshots. The relational storage layer behind it is an
/// external collaborator; this crate only depends on the contract.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self, user_id: Uuid) -> Result<FinancialSnapshot>;
}

/// Fixed demo portfolio for development and tests.
pub struct DemoSnapshotProvider;

#[async_trait]
impl SnapshotProvider for DemoSnapshotProvider {
    async fn snapshot(&self, _user_id: Uuid) -> Result<FinancialSnapshot> {
        Ok(demo_snapshot())
    }
}

pub fn demo_snapshot() -> FinancialSnapshot {
    let mut snapshot = FinancialSnapshot {
        accounts: vec![
            Account {
                id: 1,
                account_type: "tfsa".to_string(),
                product_name: "TFSA Investing".to_string(),
                balance_cad: 1_850.0,
                interest_rate: None,
                contribution_room_remaining: Some(31_500.0),
                contribution_deadline: None,
                is_active: true,
                positions: vec![
                    position("SHOP.TO", "Shopify", 24.0, 118.40, 96.15),
                    position("XEQT.TO", "iShares All-Equity", 210.0, 26.30, 29.85),
                ],
            },
            Account {
                id: 2,
                account_type: "rrsp".to_string(),
                product_name: "RRSP Investing".to_string(),
                balance_cad: 4_200.0,
                interest_rate: None,
                contribution_room_remaining: Some(14_500.0),
                contribution_deadline: NaiveDate::from_ymd_opt(2025, 3, 3),
                is_active: true,
                positions: vec![position("VFV.TO", "Vanguard S&P 500", 60.0, 101.20, 138.55)],
            },
            Account {
                id: 3,
                account_type: "fhsa".to_string(),
                product_name: "FHSA".to_string(),
                balance_cad: 0.0,
                interest_rate: None,
                contribution_room_remaining: Some(8_000.0),
                contribution_deadline: None,
                is_active: false,
                positions: vec![],
            },
            Account {
                id: 4,
                account_type: "margin".to_string(),
                product_name: "Margin Trading".to_string(),
                balance_cad: -9_800.0,
                interest_rate: Some(0.062),
                contribution_room_remaining: None,
                contribution_deadline: None,
                is_active: true,
                positions: vec![position("BN.TO", "Brookfield", 80.0, 58.75, 54.20)],
            },
        ],
        contribution_room: HashMap::from([
            ("tfsa".to_string(), 31_500.0),
            ("rrsp".to_string(), 14_500.0),
            ("fhsa".to_string(), 8_000.0),
        ]),
        margin: Some(MarginSummary {
            debit_balance: 9_800.0,
            interest_rate: 0.062,
            annual_cost: 607.6,
        }),
        total_value_cad: 0.0,
        total_gain_loss_cad: 0.0,
    };
    snapshot.recompute_totals();
    snapshot
}

fn position(ticker: &str, name: &str, shares: f64, avg_cost: f64, price: f64) -> Position {
    let mut pos = Position {
        ticker: ticker.to_string(),
        name: name.to_string(),
        shares,
        avg_cost_cad: avg_cost,
        current_price: price,
        current_value_cad: 0.0,
        unrealized_gain_loss_cad: 0.0,
    };
    pos.recompute();
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contribution_produces_new_value() {
        let baseline = demo_snapshot();
        let modified = baseline.with_contribution("rrsp", 5_000.0);

        let base_room = baseline
            .account(2)
            .and_then(|a| a.contribution_room_remaining)
            .unwrap();
        let new_room = modified
            .account(2)
            .and_then(|a| a.contribution_room_remaining)
            .unwrap();

        assert_eq!(base_room, 14_500.0);
        assert_eq!(new_room, 9_500.0);
        // baseline untouched
        assert_eq!(baseline.contribution_room["rrsp"], 14_500.0);
        assert_eq!(modified.contribution_room["rrsp"], 9_500.0);
    }

    #[test]
    fn test_sell_trade_removes_fully_sold_position() {
        let baseline = demo_snapshot();
        let modified = baseline.with_trade(1, "SHOP.TO", 24.0, TradeAction::Sell);

        assert!(modified
            .account(1)
            .unwrap()
            .positions
            .iter()
            .all(|p| p.ticker != "SHOP.TO"));
        // proceeds land in the account balance
        assert!(modified.account(1).unwrap().balance_cad > baseline.account(1).unwrap().balance_cad);
        // baseline still holds the position
        assert!(baseline
            .account(1)
            .unwrap()
            .positions
            .iter()
            .any(|p| p.ticker == "SHOP.TO"));
    }

    #[test]
    fn test_buy_trade_averages_cost() {
        let baseline = demo_snapshot();
        let modified = baseline.with_trade(1, "SHOP.TO", 24.0, TradeAction::Buy);
        let pos = modified
            .account(1)
            .unwrap()
            .positions
            .iter()
            .find(|p| p.ticker == "SHOP.TO")
            .unwrap();

        assert_eq!(pos.shares, 48.0);
        // averaged between the old cost basis and the current price
        assert!(pos.avg_cost_cad < 118.40 && pos.avg_cost_cad > 96.15);
    }

    #[test]
    fn test_margin_paydown_floors_at_zero() {
        let modified = demo_snapshot().with_margin_paydown(50_000.0);
        let margin = modified.margin.unwrap();
        assert_eq!(margin.debit_balance, 0.0);
        assert_eq!(margin.annual_cost, 0.0);
    }
}
