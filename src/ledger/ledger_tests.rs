//! Adversarial ledger tests.
//!
//! These exercise the aggregate invariants across operation sequences and
//! verify the incremental path against the recalculation engine. Written
//! to fail without proper enforcement.

use std::sync::Arc;

use crate::casino::db::{CasinoDb, CreateWithdrawalOutcome, DebitOutcome, GameRecord, JoinDuelOutcome, WithdrawalStatus};
use crate::ledger::amount::to_amount;
use crate::ledger::operations::{LedgerConfig, LedgerOpError, LedgerService};
use crate::ledger::recalc::RecalcEngine;
use crate::ledger::state::GameKind;
use crate::ledger::store::LedgerStore;

struct Fixture {
    _dir: tempfile::TempDir,
    casino: CasinoDb,
    ledger: Arc<LedgerService>,
    recalc: RecalcEngine,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let casino = CasinoDb::new(dir.path().join("c.db").to_str().unwrap()).unwrap();
    let store = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
    let ledger = LedgerService::open(store, LedgerConfig::default()).await.unwrap();
    let recalc = RecalcEngine::new(casino.clone(), ledger.clone());
    Fixture {
        _dir: dir,
        casino,
        ledger,
        recalc,
    }
}

impl Fixture {
    /// Apply a deposit to BOTH the system of record and the incremental
    /// ledger, like the settlement services do.
    async fn deposit(&self, user: i64, gross: f64, fee: f64) {
        let invoice = format!("inv-{}-{}", user, uuid::Uuid::new_v4());
        self.casino
            .insert_deposit(user, &invoice, to_amount(gross))
            .await
            .unwrap();
        self.casino
            .confirm_deposit(&invoice, to_amount(fee))
            .await
            .unwrap()
            .unwrap();
        self.ledger
            .record_deposit_confirmed(to_amount(gross), to_amount(gross - fee), to_amount(fee))
            .await
            .unwrap();
    }

    async fn play(&self, user: i64, kind: GameKind, bet: f64, won: bool, profit: f64) {
        assert!(self.casino.try_debit_balance(user, to_amount(bet)).await.unwrap());
        if won {
            self.casino
                .credit_balance(user, to_amount(bet + profit))
                .await
                .unwrap();
        }
        self.casino
            .insert_game(&GameRecord {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user,
                kind,
                bet: to_amount(bet),
                won,
                profit: to_amount(profit),
                roll: None,
                server_seed_hash: None,
                nonce: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        self.ledger
            .record_game_settled(kind, to_amount(bet), won, to_amount(profit))
            .await
            .unwrap();
    }
}

// =============================================================================
// INCREMENTAL VS RECALCULATION ROUND TRIP
// =============================================================================

#[tokio::test]
async fn test_incremental_path_matches_recalculation() {
    let fx = fixture().await;
    fx.casino.get_or_create_user(1, None).await.unwrap();
    fx.casino.get_or_create_user(2, None).await.unwrap();

    // Deposits
    fx.deposit(1, 100.0, 2.0).await;
    fx.deposit(2, 50.0, 0.0).await;

    // Games
    fx.play(1, GameKind::Dice, 10.0, false, 0.0).await;
    fx.play(2, GameKind::Slots, 5.0, true, 4.9).await;

    // Duel: user 1 stakes 10, user 2 joins, user 2 wins pot 20 minus 1.
    let DebitOutcome::Ok(duel) = fx.casino.create_duel(1, to_amount(10.0)).await.unwrap() else {
        panic!("expected duel");
    };
    let JoinDuelOutcome::Joined(_) = fx.casino.join_duel(&duel.id, 2).await.unwrap() else {
        panic!("expected join");
    };
    assert!(fx
        .casino
        .settle_duel(&duel.id, 2, to_amount(19.0), to_amount(1.0))
        .await
        .unwrap());
    fx.ledger.record_duel_settled(to_amount(1.0)).await.unwrap();

    // Promo
    fx.casino
        .create_promo_code("FREE5", to_amount(5.0), 10)
        .await
        .unwrap();
    fx.casino.redeem_promo("FREE5", 1).await.unwrap();
    fx.ledger.record_promo_redeemed(to_amount(5.0)).await.unwrap();

    // Event bet: user 2 stakes 8 and loses.
    let DebitOutcome::Ok(bet) = fx
        .casino
        .place_event_bet(2, "finals", "under", to_amount(8.0))
        .await
        .unwrap()
    else {
        panic!("expected bet");
    };
    fx.casino.settle_event_bet(&bet.id, false, 0).await.unwrap();
    fx.ledger.record_event_settled(to_amount(8.0)).await.unwrap();

    // Withdrawal: user 2 takes out 20 (fee 0.5).
    let CreateWithdrawalOutcome::Created(w) = fx
        .casino
        .create_withdrawal(2, to_amount(20.0), to_amount(19.5), to_amount(0.5), "200", false)
        .await
        .unwrap()
    else {
        panic!("expected withdrawal");
    };
    assert!(fx
        .casino
        .transition_withdrawal(&w.id, &[WithdrawalStatus::Approved], WithdrawalStatus::Processing, None)
        .await
        .unwrap());
    assert!(fx
        .casino
        .transition_withdrawal(
            &w.id,
            &[WithdrawalStatus::Processing],
            WithdrawalStatus::Completed,
            Some("tr-1"),
        )
        .await
        .unwrap());
    fx.ledger
        .record_withdrawal_completed(to_amount(20.0), to_amount(0.5))
        .await
        .unwrap();

    let incremental = fx.ledger.snapshot().await;
    let rebuilt = fx.recalc.run().await.unwrap();

    // Zero epsilon: fixed-point arithmetic on both paths.
    assert_eq!(rebuilt.operational_balance, incremental.operational_balance);
    assert_eq!(rebuilt.total_user_balance, incremental.total_user_balance);
    assert_eq!(rebuilt.total_deposits, incremental.total_deposits);
    assert_eq!(rebuilt.total_withdrawals, incremental.total_withdrawals);
    assert_eq!(rebuilt.total_bets, incremental.total_bets);
    assert_eq!(rebuilt.total_wins, incremental.total_wins);
    assert_eq!(rebuilt.total_commissions, incremental.total_commissions);
    assert_eq!(
        rebuilt.total_promocode_expenses,
        incremental.total_promocode_expenses
    );
    assert_eq!(rebuilt.total_gateway_fees, incremental.total_gateway_fees);
    assert_eq!(rebuilt.game_stats, incremental.game_stats);
    assert_eq!(
        rebuilt.commission_breakdown,
        incremental.commission_breakdown
    );

    // And the user-record sum agrees with both.
    assert_eq!(
        fx.casino.sum_user_liabilities().await.unwrap(),
        rebuilt.total_user_balance
    );
}

// =============================================================================
// CUSTODY / PROFIT SEPARATION
// =============================================================================

#[tokio::test]
async fn test_principal_flows_never_touch_operational() {
    let fx = fixture().await;

    for i in 0..10 {
        fx.ledger
            .record_deposit_confirmed(to_amount(100.0 + i as f64), to_amount(97.0 + i as f64), to_amount(3.0))
            .await
            .unwrap();
    }
    for _ in 0..5 {
        fx.ledger
            .record_withdrawal_completed(to_amount(50.0), to_amount(1.0))
            .await
            .unwrap();
    }

    let s = fx.ledger.snapshot().await;
    assert_eq!(s.operational_balance, 0);
    assert!(s.total_deposits > 0 && s.total_withdrawals > 0);
}

#[tokio::test]
async fn test_user_balance_never_negative() {
    let fx = fixture().await;
    fx.ledger
        .record_deposit_confirmed(to_amount(10.0), to_amount(10.0), 0)
        .await
        .unwrap();

    // Every drawdown larger than the aggregate is rejected wholesale.
    let err = fx
        .ledger
        .record_game_settled(GameKind::Dice, to_amount(11.0), false, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerOpError::UserBalanceUnderflow { .. }));

    let err = fx
        .ledger
        .record_withdrawal_completed(to_amount(11.0), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerOpError::UserBalanceUnderflow { .. }));

    let err = fx.ledger.record_duel_settled(to_amount(11.0)).await.unwrap_err();
    assert!(matches!(err, LedgerOpError::UserBalanceUnderflow { .. }));

    let s = fx.ledger.snapshot().await;
    assert_eq!(s.total_user_balance, to_amount(10.0));
    assert!(s.total_user_balance >= 0);
    // Nothing partially applied.
    assert_eq!(s.total_bets, 0);
    assert_eq!(s.total_withdrawals, 0);
    assert_eq!(s.total_commissions, 0);
}

#[tokio::test]
async fn test_derived_fields_consistent_after_every_operation() {
    let fx = fixture().await;
    fx.ledger
        .record_deposit_confirmed(to_amount(200.0), to_amount(200.0), 0)
        .await
        .unwrap();
    fx.ledger
        .record_game_settled(GameKind::Mines, to_amount(40.0), false, 0)
        .await
        .unwrap();
    fx.ledger.record_promo_redeemed(to_amount(3.0)).await.unwrap();

    let s = fx.ledger.snapshot().await;
    assert_eq!(
        s.reserve_balance,
        crate::ledger::amount::percent_of(s.total_user_balance, s.reserve_percentage)
    );
    assert_eq!(
        s.available_for_withdrawal,
        (s.operational_balance - s.reserve_balance).max(0)
    );
}

// =============================================================================
// OWNER WITHDRAWAL GATING UNDER DRIFTING RESERVE
// =============================================================================

#[tokio::test]
async fn test_owner_withdrawal_respects_moving_reserve() {
    let fx = fixture().await;
    fx.ledger
        .record_deposit_confirmed(to_amount(100.0), to_amount(100.0), 0)
        .await
        .unwrap();
    fx.ledger
        .record_game_settled(GameKind::Coinflip, to_amount(60.0), false, 0)
        .await
        .unwrap();

    // users 40, operational 60, reserve 12, available 48
    fx.ledger.record_owner_withdrawal(to_amount(48.0)).await.unwrap();

    // Availability is now exhausted; even the minimum is refused.
    let err = fx
        .ledger
        .record_owner_withdrawal(to_amount(1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerOpError::InsufficientAvailable { .. }));
}
