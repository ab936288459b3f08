//! Aggregate financial state of the casino.
//!
//! One `LedgerState` exists per deployment. It tracks house profit, user
//! liabilities and lifetime statistics, and is only ever mutated through
//! `LedgerService` (operations.rs) or replaced wholesale by the
//! recalculation engine (recalc.rs).
//!
//! # Invariants
//!
//! 1. `total_user_balance >= 0` in every consistent state.
//! 2. `reserve_balance == reserve_percentage% of total_user_balance`,
//!    recomputed after every mutation.
//! 3. `operational_balance` moves only with game, commission, duel and
//!    promo economics. Deposit and withdrawal principal never touch it:
//!    custody is not profit.
//! 4. External custodial balance ≈ `operational_balance +
//!    total_user_balance`, up to in-flight operations (checked by the
//!    reconciliation engine, never assumed).
//!
//! `reserve_balance`, `available_for_withdrawal` and `warnings` are pure
//! functions of the other fields. They are never set independently;
//! `derive()` recomputes all three.

use crate::ledger::amount::{percent_of, Amount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// RNG game categories tracked with their own bet/win breakdown. Event
/// bets are a separate record category; their economics enter the ledger
/// as commissions, not game stats, so the two can never double-count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    Slots,
    Dice,
    Coinflip,
    Mines,
}

impl GameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameKind::Slots => "slots",
            GameKind::Dice => "dice",
            GameKind::Coinflip => "coinflip",
            GameKind::Mines => "mines",
        }
    }

    pub fn parse(s: &str) -> Option<GameKind> {
        match s {
            "slots" => Some(GameKind::Slots),
            "dice" => Some(GameKind::Dice),
            "coinflip" => Some(GameKind::Coinflip),
            "mines" => Some(GameKind::Mines),
            _ => None,
        }
    }

    pub const ALL: [GameKind; 4] = [
        GameKind::Slots,
        GameKind::Dice,
        GameKind::Coinflip,
        GameKind::Mines,
    ];
}

/// Lifetime statistics for one game kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameTypeStats {
    pub total_bets: Amount,
    pub total_wins: Amount,
    pub total_games: u64,
    /// House profit for this kind: `total_bets - total_wins`.
    pub profit: Amount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionBreakdown {
    pub duels: Amount,
    pub events: Amount,
}

/// Derived risk flags. Deterministic functions of the current totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerWarnings {
    /// Withdrawable headroom is thin relative to house profit.
    pub low_reserve: bool,
    /// User liabilities dominate the custodial pool.
    pub high_risk_ratio: bool,
    pub negative_operational: bool,
}

/// Reserve coverage below this fraction of operational profit flags
/// `low_reserve`.
const LOW_RESERVE_COVERAGE: f64 = 0.20;
/// User liabilities above this share of (operational + liabilities) flag
/// `high_risk_ratio`.
const HIGH_RISK_SHARE: f64 = 0.80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Sum of every non-blocked user's balance plus referral balance.
    pub total_user_balance: Amount,
    /// House profit/loss accumulator. Not a cash account.
    pub operational_balance: Amount,

    /// Configured reserve fraction, display percent (30.0 == 30%).
    pub reserve_percentage: f64,
    /// Derived: `reserve_percentage% of total_user_balance`.
    pub reserve_balance: Amount,
    /// Derived: `max(0, operational_balance - reserve_balance)`.
    pub available_for_withdrawal: Amount,

    /// Lifetime gross sums, settled records only (paid / completed).
    pub total_deposits: Amount,
    pub total_withdrawals: Amount,

    pub total_bets: Amount,
    pub total_wins: Amount,
    pub game_stats: HashMap<GameKind, GameTypeStats>,

    pub total_commissions: Amount,
    pub commission_breakdown: CommissionBreakdown,

    pub total_promocode_expenses: Amount,
    pub total_gateway_fees: Amount,
    pub total_owner_withdrawals: Amount,
    pub total_referral_payments: Amount,

    pub warnings: LedgerWarnings,
    pub last_calculated: DateTime<Utc>,
    pub last_owner_withdrawal: Option<DateTime<Utc>>,
}

impl LedgerState {
    pub fn new(reserve_percentage: f64) -> Self {
        let mut state = Self {
            total_user_balance: 0,
            operational_balance: 0,
            reserve_percentage,
            reserve_balance: 0,
            available_for_withdrawal: 0,
            total_deposits: 0,
            total_withdrawals: 0,
            total_bets: 0,
            total_wins: 0,
            game_stats: HashMap::new(),
            total_commissions: 0,
            commission_breakdown: CommissionBreakdown::default(),
            total_promocode_expenses: 0,
            total_gateway_fees: 0,
            total_owner_withdrawals: 0,
            total_referral_payments: 0,
            warnings: LedgerWarnings::default(),
            last_calculated: Utc::now(),
            last_owner_withdrawal: None,
        };
        state.derive();
        state
    }

    /// Recompute every derived field. Must run after any mutation, before
    /// the state is persisted or observed.
    pub fn derive(&mut self) {
        self.calculate_reserve();
        self.check_warnings();
    }

    fn calculate_reserve(&mut self) {
        self.reserve_balance = percent_of(self.total_user_balance, self.reserve_percentage);
        self.available_for_withdrawal = (self.operational_balance - self.reserve_balance).max(0);
    }

    fn check_warnings(&mut self) {
        self.warnings.negative_operational = self.operational_balance < 0;

        self.warnings.low_reserve = self.operational_balance > 0
            && (self.available_for_withdrawal as f64)
                < (self.operational_balance as f64) * LOW_RESERVE_COVERAGE;

        let pool = self.operational_balance.saturating_add(self.total_user_balance);
        self.warnings.high_risk_ratio =
            pool > 0 && (self.total_user_balance as f64) > (pool as f64) * HIGH_RISK_SHARE;
    }

    pub fn stats_for(&mut self, kind: GameKind) -> &mut GameTypeStats {
        self.game_stats.entry(kind).or_default()
    }

    /// The gateway-independent derivation of expected custody. The
    /// reconciliation engine computes `total_deposits - total_withdrawals -
    /// total_owner_withdrawals` separately and cross-checks the two.
    pub fn custody_view(&self) -> Amount {
        self.operational_balance + self.total_user_balance
    }
}
