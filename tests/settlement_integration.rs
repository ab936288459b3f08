//! End-to-end settlement tests.
//!
//! Drive the real services (games, duels, deposits, withdrawals, promos,
//! event bets) against tempfile-backed databases and a scripted gateway,
//! then check the system-level properties: the incremental ledger agrees
//! with a full recalculation, failed transfers compensate, concurrent
//! spends admit exactly one winner, and reconciliation classifies the
//! result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rollhouse_backend::alerts::NoopNotifier;
use rollhouse_backend::casino::db::CasinoDb;
use rollhouse_backend::casino::deposits::{DepositConfig, DepositService};
use rollhouse_backend::casino::duels::{DuelConfig, DuelService};
use rollhouse_backend::casino::events::{EventBetConfig, EventBetService};
use rollhouse_backend::casino::fair::FairRoller;
use rollhouse_backend::casino::games::{GameConfig, GameService};
use rollhouse_backend::casino::promos::PromoService;
use rollhouse_backend::casino::db::WithdrawalStatus;
use rollhouse_backend::casino::withdrawals::{WithdrawalConfig, WithdrawalService};
use rollhouse_backend::gateway::{
    GatewayBalance, GatewayError, InvoiceHandle, PaymentGateway, TransferReceipt,
};
use rollhouse_backend::ledger::amount::{to_amount, Amount};
use rollhouse_backend::ledger::operations::{LedgerConfig, LedgerService};
use rollhouse_backend::ledger::recalc::RecalcEngine;
use rollhouse_backend::ledger::state::GameKind;
use rollhouse_backend::ledger::store::LedgerStore;
use rollhouse_backend::reconcile::{ReconcileConfig, ReconcileEngine, Severity};

/// Scripted gateway: solvent by default, transfer leg can be failed.
struct ScriptedGateway {
    balance: std::sync::Mutex<Amount>,
    fail_transfers: AtomicBool,
}

impl ScriptedGateway {
    fn new(balance: f64) -> Self {
        Self {
            balance: std::sync::Mutex::new(to_amount(balance)),
            fail_transfers: AtomicBool::new(false),
        }
    }

    fn set_balance(&self, coins: f64) {
        *self.balance.lock().unwrap() = to_amount(coins);
    }
}

#[async_trait::async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn get_balance(&self, _asset: &str) -> Result<GatewayBalance, GatewayError> {
        let total = *self.balance.lock().unwrap();
        Ok(GatewayBalance {
            available: total,
            onhold: 0,
            total,
        })
    }

    async fn transfer(
        &self,
        _recipient_id: i64,
        _asset: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<TransferReceipt, GatewayError> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("scripted outage".to_string()));
        }
        Ok(TransferReceipt {
            transfer_id: format!("tr-{}", idempotency_key),
            amount,
            fee: 0,
        })
    }

    async fn create_invoice(
        &self,
        _asset: &str,
        _amount: Amount,
        _description: &str,
    ) -> Result<InvoiceHandle, GatewayError> {
        Ok(InvoiceHandle {
            invoice_id: uuid::Uuid::new_v4().to_string(),
            pay_url: "https://t.me/pay".to_string(),
        })
    }
}

struct World {
    _dir: tempfile::TempDir,
    db: CasinoDb,
    ledger: Arc<LedgerService>,
    recalc: RecalcEngine,
    gateway: Arc<ScriptedGateway>,
    games: GameService,
    duels: DuelService,
    events: EventBetService,
    deposits: DepositService,
    withdrawals: WithdrawalService,
    promos: PromoService,
    store: LedgerStore,
}

async fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let db = CasinoDb::new(dir.path().join("casino.db").to_str().unwrap()).unwrap();
    let store = LedgerStore::new(dir.path().join("ledger.db").to_str().unwrap()).unwrap();
    let ledger = LedgerService::open(store.clone(), LedgerConfig::default())
        .await
        .unwrap();
    let gateway = Arc::new(ScriptedGateway::new(100_000.0));
    let fair = Arc::new(FairRoller::with_seed("integration-seed"));

    World {
        db: db.clone(),
        ledger: ledger.clone(),
        recalc: RecalcEngine::new(db.clone(), ledger.clone()),
        games: GameService::new(db.clone(), ledger.clone(), fair.clone(), GameConfig::default()),
        duels: DuelService::new(db.clone(), ledger.clone(), fair, DuelConfig::default()),
        events: EventBetService::new(db.clone(), ledger.clone(), EventBetConfig::default()),
        deposits: DepositService::new(
            db.clone(),
            ledger.clone(),
            gateway.clone(),
            DepositConfig::default(),
        ),
        withdrawals: WithdrawalService::new(
            db.clone(),
            ledger.clone(),
            gateway.clone(),
            WithdrawalConfig::default(),
        ),
        promos: PromoService::new(db, ledger),
        gateway,
        store,
        _dir: dir,
    }
}

impl World {
    async fn deposit(&self, user: i64, amount: f64, fee: f64) {
        let pending = self.deposits.create(user, to_amount(amount)).await.unwrap();
        self.deposits
            .confirm(&pending.deposit.invoice_id, to_amount(fee))
            .await
            .unwrap()
            .unwrap();
    }

    fn reconcile_engine(&self) -> ReconcileEngine {
        ReconcileEngine::new(
            Arc::new(RecalcEngine::new(self.db.clone(), self.ledger.clone())),
            self.gateway.clone(),
            self.store.clone(),
            Arc::new(NoopNotifier),
            ReconcileConfig {
                // Force a rebuild from the system of record on every run.
                max_state_age: chrono::Duration::zero(),
                ..ReconcileConfig::default()
            },
        )
    }
}

#[tokio::test]
async fn test_mixed_activity_round_trips_through_recalculation() {
    let w = world().await;
    w.deposit(1, 500.0, 5.0).await;
    w.deposit(2, 300.0, 0.0).await;

    // A burst of games across kinds.
    for i in 0..20 {
        let kind = GameKind::ALL[i % GameKind::ALL.len()];
        let user = 1 + (i % 2) as i64;
        let _ = w
            .games
            .play(user, kind, to_amount(5.0), &format!("seed-{}", i))
            .await
            .unwrap();
    }

    // Duels.
    for _ in 0..3 {
        let duel = w.duels.create(1, to_amount(10.0)).await.unwrap();
        w.duels.join_and_settle(&duel.id, 2).await.unwrap();
    }

    // Promo motion.
    w.promos.create_code("WELCOME", to_amount(7.0), 5).await.unwrap();
    w.promos.redeem("WELCOME", 2).await.unwrap();

    // Event book.
    let bet = w
        .events
        .place(1, "cup-final", "home", to_amount(12.0))
        .await
        .unwrap();
    w.events.settle(&bet.id, false, 0).await.unwrap();

    // A successful withdrawal.
    let receipt = w
        .withdrawals
        .request(2, to_amount(40.0), "555")
        .await
        .unwrap();
    assert_eq!(receipt.withdrawal.status, WithdrawalStatus::Completed);

    let incremental = w.ledger.snapshot().await;
    let rebuilt = w.recalc.run().await.unwrap();

    assert_eq!(rebuilt.operational_balance, incremental.operational_balance);
    assert_eq!(rebuilt.total_user_balance, incremental.total_user_balance);
    assert_eq!(rebuilt.total_bets, incremental.total_bets);
    assert_eq!(rebuilt.total_wins, incremental.total_wins);
    assert_eq!(rebuilt.total_commissions, incremental.total_commissions);
    assert_eq!(rebuilt.total_deposits, incremental.total_deposits);
    assert_eq!(rebuilt.total_withdrawals, incremental.total_withdrawals);
    assert_eq!(
        w.db.sum_user_liabilities().await.unwrap(),
        rebuilt.total_user_balance
    );
    assert!(rebuilt.total_user_balance >= 0);
}

#[tokio::test]
async fn test_failed_transfer_compensates_and_reconciles_clean() {
    let w = world().await;
    w.deposit(1, 200.0, 0.0).await;

    w.gateway.fail_transfers.store(true, Ordering::SeqCst);
    let receipt = w
        .withdrawals
        .request(1, to_amount(80.0), "777")
        .await
        .unwrap();
    assert_eq!(receipt.withdrawal.status, WithdrawalStatus::Failed);
    assert!(receipt.withdrawal.refunded);

    // Pre-debit balance restored, record terminal, no ledger motion.
    let user = w.db.get_user(1).await.unwrap().unwrap();
    assert_eq!(user.balance, to_amount(200.0));
    assert_eq!(w.ledger.snapshot().await.total_withdrawals, 0);

    // Gateway still holds the full deposit; reconciliation is clean.
    w.gateway.set_balance(200.0);
    let report = w.reconcile_engine().run().await.unwrap();
    assert_eq!(report.severity, Severity::Ok);
}

#[tokio::test]
async fn test_concurrent_spends_admit_exactly_one_winner() {
    let w = world().await;
    w.deposit(1, 100.0, 0.0).await;

    // Two 60-coin spends against a 100-coin balance, racing.
    let db_a = w.db.clone();
    let db_b = w.db.clone();
    let a = tokio::spawn(async move { db_a.try_debit_balance(1, to_amount(60.0)).await.unwrap() });
    let b = tokio::spawn(async move { db_b.try_debit_balance(1, to_amount(60.0)).await.unwrap() });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(a ^ b, "exactly one spend must win, got a={} b={}", a, b);
    assert_eq!(
        w.db.get_user(1).await.unwrap().unwrap().balance,
        to_amount(40.0)
    );
}

#[tokio::test]
async fn test_concurrent_withdrawal_requests_single_in_flight() {
    let w = world().await;
    w.deposit(1, 100.0, 0.0).await;

    // Both fit the balance individually; the in-flight rule allows one.
    let svc_a = WithdrawalService::new(
        w.db.clone(),
        w.ledger.clone(),
        w.gateway.clone(),
        WithdrawalConfig {
            // Force both to stop at pending so neither resolves first.
            approval_threshold: to_amount(1.0),
            ..WithdrawalConfig::default()
        },
    );
    let svc_b = WithdrawalService::new(
        w.db.clone(),
        w.ledger.clone(),
        w.gateway.clone(),
        WithdrawalConfig {
            approval_threshold: to_amount(1.0),
            ..WithdrawalConfig::default()
        },
    );

    let a = tokio::spawn(async move { svc_a.request(1, to_amount(30.0), "555").await });
    let b = tokio::spawn(async move { svc_b.request(1, to_amount(30.0), "555").await });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(
        a.is_ok() ^ b.is_ok(),
        "exactly one withdrawal may enter flight"
    );
    // One 30-coin escrow taken, not two.
    assert_eq!(
        w.db.get_user(1).await.unwrap().unwrap().balance,
        to_amount(70.0)
    );
}

#[tokio::test]
async fn test_reconciliation_flags_fabricated_liabilities() {
    let w = world().await;
    w.deposit(1, 100.0, 0.0).await;
    // An unbacked credit sneaks into the system of record (the bug class
    // reconciliation exists to catch).
    w.db.credit_balance(1, to_amount(500.0)).await.unwrap();
    w.gateway.set_balance(100.0);

    let report = w.reconcile_engine().run().await.unwrap();
    assert_eq!(report.severity, Severity::Critical);
    assert!(!report.logic_violations.is_empty());
}

#[tokio::test]
async fn test_full_recalculation_corrects_drifted_aggregate() {
    let w = world().await;
    w.deposit(1, 100.0, 0.0).await;

    // Simulate drift: a ledger operation that never happened in the
    // system of record.
    w.ledger
        .record_game_settled(GameKind::Dice, to_amount(30.0), false, 0)
        .await
        .unwrap();
    assert_eq!(
        w.ledger.snapshot().await.operational_balance,
        to_amount(30.0)
    );

    let rebuilt = w.recalc.run().await.unwrap();
    assert_eq!(rebuilt.operational_balance, 0);
    assert_eq!(rebuilt.total_user_balance, to_amount(100.0));

    // Idempotent: a second run changes nothing but the timestamp.
    let again = w.recalc.run().await.unwrap();
    assert_eq!(again.operational_balance, rebuilt.operational_balance);
    assert_eq!(again.total_user_balance, rebuilt.total_user_balance);
}
