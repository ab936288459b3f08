//! Ledger update operations.
//!
//! `LedgerService` is the only sanctioned write path to `LedgerState`:
//! one method per financial event. Nothing else in the crate ever holds a
//! `&mut LedgerState`, so the invariants in state.rs can be asserted here
//! and nowhere else.
//!
//! Every operation follows the same shape: clone the current state, apply
//! the event, recompute the derived fields, persist state + history entry
//! in one transaction, and only then commit the clone to memory. A failed
//! write leaves the in-memory state untouched.
//!
//! # Effect table
//!
//! | Event | Effect |
//! |---|---|
//! | Game settled | bets += bet; win: wins += bet+profit, operational -= profit, users += profit; loss: operational += bet, users -= bet |
//! | Deposit confirmed | deposits += gross; users += net; fees += fee; operational UNCHANGED |
//! | Withdrawal completed | withdrawals += gross; users -= gross; fees += fee; operational UNCHANGED |
//! | Duel settled | commissions += c; breakdown.duels += c; operational += c; users -= c |
//! | Promo redeemed | promo expenses += v; operational -= v; users += v |
//! | Referral payout | referral payments += a; nothing else (internal transfer) |
//! | Owner withdrawal | operational -= a; owner withdrawals += a; gated by availability |
//!
//! Game and duel settlement carry the user-liability delta alongside the
//! profit delta; without it the incremental path could never agree with a
//! full recalculation from the user records.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ledger::amount::{format_amount, Amount};
use crate::ledger::state::{GameKind, LedgerState};
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Display percent of user liabilities held back from owner
    /// withdrawals (30.0 == 30%).
    pub reserve_percentage: f64,
    pub min_owner_withdrawal: Amount,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reserve_percentage: 30.0,
            min_owner_withdrawal: crate::ledger::amount::AMOUNT_SCALE,
        }
    }
}

/// Why an update operation refused to apply. Operations reject atomically;
/// a returned error means no state changed.
#[derive(Debug, thiserror::Error)]
pub enum LedgerOpError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("net {net} exceeds gross {gross}")]
    NetExceedsGross { gross: Amount, net: Amount },

    #[error("operation would drive total_user_balance negative ({current} - {delta})")]
    UserBalanceUnderflow { current: Amount, delta: Amount },

    #[error("owner withdrawal {requested} exceeds available {available}")]
    InsufficientAvailable { requested: Amount, available: Amount },

    #[error("owner withdrawal {requested} below minimum {minimum}")]
    BelowMinimumWithdrawal { requested: Amount, minimum: Amount },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Single logical ledger instance, get-or-create on open.
pub struct LedgerService {
    store: LedgerStore,
    state: Mutex<LedgerState>,
    config: LedgerConfig,
}

impl LedgerService {
    /// Load the persisted state or create a fresh one. The configured
    /// reserve percentage always wins over the stored one so config
    /// changes take effect on restart.
    pub async fn open(store: LedgerStore, config: LedgerConfig) -> Result<Arc<Self>> {
        let state = match store.load_state().await? {
            Some(mut state) => {
                if state.reserve_percentage != config.reserve_percentage {
                    info!(
                        old = state.reserve_percentage,
                        new = config.reserve_percentage,
                        "reserve percentage changed, re-deriving"
                    );
                    state.reserve_percentage = config.reserve_percentage;
                    state.derive();
                    store
                        .persist_state(&state, "reserve_reconfigured", &json!({}))
                        .await?;
                }
                state
            }
            None => {
                let state = LedgerState::new(config.reserve_percentage);
                store.persist_state(&state, "initialized", &json!({})).await?;
                info!("ledger state initialized");
                state
            }
        };

        Ok(Arc::new(Self {
            store,
            state: Mutex::new(state),
            config,
        }))
    }

    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Recent audit-trail entries, most recent first.
    pub async fn history(
        &self,
        limit: usize,
    ) -> Result<Vec<crate::ledger::store::HistoryEntry>> {
        self.store.list_history(limit).await
    }

    /// A settled game round. `profit` is the net win above the stake; it
    /// must be 0 when `won` is false.
    pub async fn record_game_settled(
        &self,
        kind: GameKind,
        bet: Amount,
        won: bool,
        profit: Amount,
    ) -> Result<(), LedgerOpError> {
        if bet <= 0 {
            return Err(LedgerOpError::NonPositiveAmount(bet));
        }
        if profit < 0 || (!won && profit != 0) {
            return Err(LedgerOpError::NonPositiveAmount(profit));
        }

        let mut guard = self.state.lock().await;
        let mut next = guard.clone();

        next.total_bets += bet;
        let stats = next.stats_for(kind);
        stats.total_bets += bet;
        stats.total_games += 1;

        if won {
            let payout = bet + profit;
            next.total_wins += payout;
            let stats = next.stats_for(kind);
            stats.total_wins += payout;
            next.operational_balance -= profit;
            next.total_user_balance += profit;
        } else {
            if next.total_user_balance < bet {
                return Err(LedgerOpError::UserBalanceUnderflow {
                    current: next.total_user_balance,
                    delta: bet,
                });
            }
            next.operational_balance += bet;
            next.total_user_balance -= bet;
        }
        let stats = next.stats_for(kind);
        stats.profit = stats.total_bets - stats.total_wins;

        self.commit(
            &mut guard,
            next,
            "game_settled",
            json!({
                "kind": kind.as_str(),
                "bet": bet,
                "won": won,
                "profit": profit,
            }),
        )
        .await
    }

    /// A deposit that reached `paid`. Principal is custody, not profit:
    /// `operational_balance` must not move here.
    pub async fn record_deposit_confirmed(
        &self,
        gross: Amount,
        net: Amount,
        fee: Amount,
    ) -> Result<(), LedgerOpError> {
        if gross <= 0 || net <= 0 || fee < 0 {
            return Err(LedgerOpError::NonPositiveAmount(gross.min(net)));
        }
        if net > gross {
            return Err(LedgerOpError::NetExceedsGross { gross, net });
        }

        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        next.total_deposits += gross;
        next.total_user_balance += net;
        next.total_gateway_fees += fee;

        self.commit(
            &mut guard,
            next,
            "deposit_confirmed",
            json!({ "gross": gross, "net": net, "fee": fee }),
        )
        .await
    }

    /// A withdrawal that reached `completed`. Same custody rule as
    /// deposits: `operational_balance` must not move.
    pub async fn record_withdrawal_completed(
        &self,
        gross: Amount,
        fee: Amount,
    ) -> Result<(), LedgerOpError> {
        if gross <= 0 || fee < 0 {
            return Err(LedgerOpError::NonPositiveAmount(gross));
        }

        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        if next.total_user_balance < gross {
            return Err(LedgerOpError::UserBalanceUnderflow {
                current: next.total_user_balance,
                delta: gross,
            });
        }
        next.total_withdrawals += gross;
        next.total_user_balance -= gross;
        next.total_gateway_fees += fee;

        self.commit(
            &mut guard,
            next,
            "withdrawal_completed",
            json!({ "gross": gross, "fee": fee }),
        )
        .await
    }

    /// A settled PvP duel. Stakes were already escrowed out of the user
    /// balances; the house keeps the commission, so user liabilities net
    /// out `-commission`.
    pub async fn record_duel_settled(&self, commission: Amount) -> Result<(), LedgerOpError> {
        if commission <= 0 {
            return Err(LedgerOpError::NonPositiveAmount(commission));
        }

        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        if next.total_user_balance < commission {
            return Err(LedgerOpError::UserBalanceUnderflow {
                current: next.total_user_balance,
                delta: commission,
            });
        }
        next.total_commissions += commission;
        next.commission_breakdown.duels += commission;
        next.operational_balance += commission;
        next.total_user_balance -= commission;

        self.commit(
            &mut guard,
            next,
            "duel_settled",
            json!({ "commission": commission }),
        )
        .await
    }

    /// A settled event. `net_commission` is the house edge realized on
    /// that event's book (stakes kept minus payouts made); negative when
    /// the book lost.
    pub async fn record_event_settled(
        &self,
        net_commission: Amount,
    ) -> Result<(), LedgerOpError> {
        if net_commission == 0 {
            return Err(LedgerOpError::NonPositiveAmount(net_commission));
        }

        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        if net_commission > 0 && next.total_user_balance < net_commission {
            return Err(LedgerOpError::UserBalanceUnderflow {
                current: next.total_user_balance,
                delta: net_commission,
            });
        }
        next.total_commissions += net_commission;
        next.commission_breakdown.events += net_commission;
        next.operational_balance += net_commission;
        next.total_user_balance -= net_commission;

        self.commit(
            &mut guard,
            next,
            "event_settled",
            json!({ "net_commission": net_commission }),
        )
        .await
    }

    /// A balance-type promo code redemption: new obligation minted from
    /// house profit.
    pub async fn record_promo_redeemed(&self, value: Amount) -> Result<(), LedgerOpError> {
        if value <= 0 {
            return Err(LedgerOpError::NonPositiveAmount(value));
        }

        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        next.total_promocode_expenses += value;
        next.operational_balance -= value;
        next.total_user_balance += value;

        self.commit(
            &mut guard,
            next,
            "promo_redeemed",
            json!({ "value": value }),
        )
        .await
    }

    /// A referral payout moves funds between two already-accounted user
    /// balances (referral -> primary). Statistics counter only; any
    /// aggregate change here would double-count the obligation.
    pub async fn record_referral_payout(&self, amount: Amount) -> Result<(), LedgerOpError> {
        if amount <= 0 {
            return Err(LedgerOpError::NonPositiveAmount(amount));
        }

        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        next.total_referral_payments += amount;

        self.commit(
            &mut guard,
            next,
            "referral_payout",
            json!({ "amount": amount }),
        )
        .await
    }

    /// Owner profit withdrawal, gated by the reserve-adjusted availability
    /// derived from the current state.
    pub async fn record_owner_withdrawal(&self, amount: Amount) -> Result<(), LedgerOpError> {
        let mut guard = self.state.lock().await;

        if amount < self.config.min_owner_withdrawal {
            return Err(LedgerOpError::BelowMinimumWithdrawal {
                requested: amount,
                minimum: self.config.min_owner_withdrawal,
            });
        }
        if amount > guard.available_for_withdrawal {
            return Err(LedgerOpError::InsufficientAvailable {
                requested: amount,
                available: guard.available_for_withdrawal,
            });
        }

        let mut next = guard.clone();
        next.operational_balance -= amount;
        next.total_owner_withdrawals += amount;
        next.last_owner_withdrawal = Some(Utc::now());

        warn!(amount = %format_amount(amount), "owner withdrawal recorded");
        self.commit(
            &mut guard,
            next,
            "owner_withdrawal",
            json!({ "amount": amount }),
        )
        .await
    }

    /// Wholesale replacement by the recalculation engine. Not an
    /// incremental operation; the new state was rebuilt from the system of
    /// record and already carries `last_calculated`.
    pub async fn replace_state(&self, mut new_state: LedgerState) -> Result<()> {
        new_state.derive();
        let mut guard = self.state.lock().await;
        let payload = json!({
            "previous_operational": guard.operational_balance,
            "previous_user_balance": guard.total_user_balance,
            "operational": new_state.operational_balance,
            "user_balance": new_state.total_user_balance,
        });
        self.store
            .persist_state(&new_state, "full_recalculation", &payload)
            .await?;
        *guard = new_state;
        info!("ledger state replaced by full recalculation");
        Ok(())
    }

    async fn commit(
        &self,
        guard: &mut LedgerState,
        mut next: LedgerState,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), LedgerOpError> {
        next.derive();
        self.store.persist_state(&next, kind, &payload).await?;
        debug!(
            kind,
            operational = %format_amount(next.operational_balance),
            users = %format_amount(next.total_user_balance),
            "ledger operation committed"
        );
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::amount::to_amount;

    async fn service() -> (tempfile::TempDir, Arc<LedgerService>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        let svc = LedgerService::open(store, LedgerConfig::default()).await.unwrap();
        (dir, svc)
    }

    /// Seed user liabilities so spend-side operations have something to
    /// draw down.
    async fn seed_deposit(svc: &LedgerService, coins: f64) {
        svc.record_deposit_confirmed(to_amount(coins), to_amount(coins), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deposit_effect() {
        let (_d, svc) = service().await;
        svc.record_deposit_confirmed(to_amount(100.0), to_amount(97.0), to_amount(3.0))
            .await
            .unwrap();

        let s = svc.snapshot().await;
        assert_eq!(s.total_deposits, to_amount(100.0));
        assert_eq!(s.total_user_balance, to_amount(97.0));
        assert_eq!(s.total_gateway_fees, to_amount(3.0));
        assert_eq!(s.operational_balance, 0);
    }

    #[tokio::test]
    async fn test_withdrawal_effect_and_underflow() {
        let (_d, svc) = service().await;
        seed_deposit(&svc, 100.0).await;

        svc.record_withdrawal_completed(to_amount(40.0), to_amount(1.0))
            .await
            .unwrap();
        let s = svc.snapshot().await;
        assert_eq!(s.total_withdrawals, to_amount(40.0));
        assert_eq!(s.total_user_balance, to_amount(60.0));
        assert_eq!(s.operational_balance, 0);

        let err = svc
            .record_withdrawal_completed(to_amount(1000.0), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerOpError::UserBalanceUnderflow { .. }));
        // Rejected atomically.
        assert_eq!(svc.snapshot().await.total_user_balance, to_amount(60.0));
    }

    #[tokio::test]
    async fn test_game_loss_and_win() {
        let (_d, svc) = service().await;
        seed_deposit(&svc, 100.0).await;

        svc.record_game_settled(GameKind::Dice, to_amount(10.0), false, 0)
            .await
            .unwrap();
        let s = svc.snapshot().await;
        assert_eq!(s.operational_balance, to_amount(10.0));
        assert_eq!(s.total_user_balance, to_amount(90.0));
        assert_eq!(s.total_bets, to_amount(10.0));
        assert_eq!(s.total_wins, 0);

        svc.record_game_settled(GameKind::Dice, to_amount(10.0), true, to_amount(9.8))
            .await
            .unwrap();
        let s = svc.snapshot().await;
        assert_eq!(s.operational_balance, to_amount(0.2));
        assert_eq!(s.total_user_balance, to_amount(99.8));
        assert_eq!(s.total_wins, to_amount(19.8));

        let dice = s.game_stats[&GameKind::Dice];
        assert_eq!(dice.total_games, 2);
        assert_eq!(dice.profit, to_amount(0.2));
    }

    #[tokio::test]
    async fn test_duel_and_promo() {
        let (_d, svc) = service().await;
        seed_deposit(&svc, 100.0).await;

        svc.record_duel_settled(to_amount(1.0)).await.unwrap();
        let s = svc.snapshot().await;
        assert_eq!(s.total_commissions, to_amount(1.0));
        assert_eq!(s.commission_breakdown.duels, to_amount(1.0));
        assert_eq!(s.operational_balance, to_amount(1.0));
        assert_eq!(s.total_user_balance, to_amount(99.0));

        svc.record_promo_redeemed(to_amount(5.0)).await.unwrap();
        let s = svc.snapshot().await;
        assert_eq!(s.total_promocode_expenses, to_amount(5.0));
        assert_eq!(s.operational_balance, to_amount(-4.0));
        assert_eq!(s.total_user_balance, to_amount(104.0));
        assert!(s.warnings.negative_operational);
    }

    #[tokio::test]
    async fn test_referral_payout_touches_nothing_else() {
        let (_d, svc) = service().await;
        seed_deposit(&svc, 100.0).await;
        let before = svc.snapshot().await;

        svc.record_referral_payout(to_amount(7.0)).await.unwrap();
        let after = svc.snapshot().await;
        assert_eq!(after.total_referral_payments, to_amount(7.0));
        assert_eq!(after.total_user_balance, before.total_user_balance);
        assert_eq!(after.operational_balance, before.operational_balance);
    }

    #[tokio::test]
    async fn test_owner_withdrawal_gates() {
        let (_d, svc) = service().await;
        seed_deposit(&svc, 100.0).await;
        // Build profit: users lose 50 across games.
        svc.record_game_settled(GameKind::Slots, to_amount(50.0), false, 0)
            .await
            .unwrap();

        let s = svc.snapshot().await;
        // reserve = 30% of 50 = 15, available = 50 - 15 = 35
        assert_eq!(s.available_for_withdrawal, to_amount(35.0));

        let err = svc
            .record_owner_withdrawal(to_amount(36.0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerOpError::InsufficientAvailable { .. }));

        let err = svc
            .record_owner_withdrawal(to_amount(0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerOpError::BelowMinimumWithdrawal { .. }));

        svc.record_owner_withdrawal(to_amount(35.0)).await.unwrap();
        let s = svc.snapshot().await;
        assert_eq!(s.operational_balance, to_amount(15.0));
        assert_eq!(s.total_owner_withdrawals, to_amount(35.0));
        assert!(s.last_owner_withdrawal.is_some());
    }

    #[tokio::test]
    async fn test_reserve_recomputed_every_operation() {
        let (_d, svc) = service().await;
        seed_deposit(&svc, 100.0).await;
        let s = svc.snapshot().await;
        assert_eq!(s.reserve_balance, to_amount(30.0));

        svc.record_promo_redeemed(to_amount(10.0)).await.unwrap();
        let s = svc.snapshot().await;
        assert_eq!(s.reserve_balance, to_amount(33.0));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.db");
        {
            let store = LedgerStore::new(path.to_str().unwrap()).unwrap();
            let svc = LedgerService::open(store, LedgerConfig::default()).await.unwrap();
            svc.record_deposit_confirmed(to_amount(10.0), to_amount(10.0), 0)
                .await
                .unwrap();
        }
        let store = LedgerStore::new(path.to_str().unwrap()).unwrap();
        let svc = LedgerService::open(store, LedgerConfig::default()).await.unwrap();
        assert_eq!(svc.snapshot().await.total_deposits, to_amount(10.0));
    }
}
