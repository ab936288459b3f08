//! System of record: users, deposits, withdrawals, games, duels, promo
//! codes. The ledger treats these tables as authoritative; the full
//! recalculation engine rebuilds the aggregate state from the sums
//! exposed at the bottom of this file.
//!
//! Spend paths never read-then-write a balance. Every debit is a single
//! conditional UPDATE (`... AND balance >= ?`) so concurrent spend
//! attempts against the same user admit exactly one winner.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ledger::amount::Amount;
use crate::ledger::state::GameKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: Option<String>,
    pub balance: Amount,
    pub referral_balance: Amount,
    pub referrer_id: Option<i64>,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Paid,
    Failed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Paid => "paid",
            DepositStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRecord {
    pub id: String,
    pub user_id: i64,
    pub invoice_id: String,
    /// Gross amount invoiced.
    pub amount: Amount,
    /// Credited to the user: gross minus gateway fee. 0 until paid.
    pub net_amount: Amount,
    pub fee: Amount,
    pub status: DepositStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Withdrawal lifecycle. Transitions once to a terminal status:
/// `pending -> approved -> processing -> completed`, with
/// `pending -> rejected` and `processing -> failed` branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Processing,
    Completed,
    Rejected,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Still holds the user's debited funds.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub id: String,
    pub user_id: i64,
    /// Gross amount debited from the user.
    pub amount: Amount,
    /// Sent to the recipient: gross minus gateway fee estimate.
    pub net_amount: Amount,
    pub fee: Amount,
    pub recipient: String,
    pub status: WithdrawalStatus,
    pub requires_approval: bool,
    pub transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    /// Compensating credit applied after rejection/failure.
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    pub user_id: i64,
    pub kind: GameKind,
    pub bet: Amount,
    pub won: bool,
    /// Net win above the stake; 0 on loss.
    pub profit: Amount,
    pub roll: Option<f64>,
    pub server_seed_hash: Option<String>,
    pub nonce: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    Open,
    Active,
    Completed,
    Cancelled,
}

impl DuelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuelStatus::Open => "open",
            DuelStatus::Active => "active",
            DuelStatus::Completed => "completed",
            DuelStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelRecord {
    pub id: String,
    pub creator_id: i64,
    pub opponent_id: Option<i64>,
    pub stake: Amount,
    pub commission: Amount,
    pub winner_id: Option<i64>,
    pub status: DuelStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Bets on operator-scheduled events. Settled by admins, not RNG. Their
/// house edge enters the ledger as the "events" commission; they are
/// deliberately NOT game records so recalculation cannot double-count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBetStatus {
    Open,
    Won,
    Lost,
    Refunded,
}

impl EventBetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventBetStatus::Open => "open",
            EventBetStatus::Won => "won",
            EventBetStatus::Lost => "lost",
            EventBetStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBetRecord {
    pub id: String,
    pub user_id: i64,
    pub event_id: String,
    pub selection: String,
    pub stake: Amount,
    /// Credited on win; 0 otherwise.
    pub payout: Amount,
    pub status: EventBetStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCode {
    pub code: String,
    /// Only "balance" codes touch the ledger.
    pub kind: String,
    pub value: Amount,
    pub max_activations: i64,
    pub activations: i64,
    pub created_at: DateTime<Utc>,
}

/// Multi-check operations report which guard failed so the service layer
/// can surface a precise error without a second racy read.
#[derive(Debug)]
pub enum DebitOutcome<T> {
    Ok(T),
    InsufficientFunds,
    Blocked,
}

#[derive(Debug)]
pub enum CreateWithdrawalOutcome {
    Created(WithdrawalRecord),
    InFlightExists,
    InsufficientFunds,
}

#[derive(Debug)]
pub enum JoinDuelOutcome {
    Joined(DuelRecord),
    NotOpen,
    SelfJoin,
    InsufficientFunds,
}

#[derive(Debug)]
pub enum RedeemOutcome {
    Redeemed { value: Amount },
    UnknownCode,
    Exhausted,
    AlreadyRedeemed,
}

/// Per-kind aggregate used by the recalculation engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct GameAggregate {
    pub total_bets: Amount,
    pub total_wins: Amount,
    pub total_games: u64,
}

#[derive(Clone)]
pub struct CasinoDb {
    conn: Arc<Mutex<Connection>>,
}

impl CasinoDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open casino db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT,
                balance INTEGER NOT NULL DEFAULT 0,
                referral_balance INTEGER NOT NULL DEFAULT 0,
                referrer_id INTEGER,
                is_blocked INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS deposits (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                invoice_id TEXT UNIQUE NOT NULL,
                amount INTEGER NOT NULL,
                net_amount INTEGER NOT NULL DEFAULT 0,
                fee INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                paid_at TEXT,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS withdrawals (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                net_amount INTEGER NOT NULL,
                fee INTEGER NOT NULL DEFAULT 0,
                recipient TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                requires_approval INTEGER NOT NULL DEFAULT 0,
                transfer_id TEXT,
                failure_reason TEXT,
                refunded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS games (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                bet INTEGER NOT NULL,
                won INTEGER NOT NULL,
                profit INTEGER NOT NULL DEFAULT 0,
                roll REAL,
                server_seed_hash TEXT,
                nonce INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS duels (
                id TEXT PRIMARY KEY,
                creator_id INTEGER NOT NULL,
                opponent_id INTEGER,
                stake INTEGER NOT NULL,
                commission INTEGER NOT NULL DEFAULT 0,
                winner_id INTEGER,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                settled_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS promo_codes (
                code TEXT PRIMARY KEY,
                kind TEXT NOT NULL DEFAULT 'balance',
                value INTEGER NOT NULL,
                max_activations INTEGER NOT NULL,
                activations INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS event_bets (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                selection TEXT NOT NULL,
                stake INTEGER NOT NULL,
                payout INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                settled_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS owner_withdrawals (
                id TEXT PRIMARY KEY,
                amount INTEGER NOT NULL,
                transfer_id TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS referral_payouts (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS promo_redemptions (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                value INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'completed',
                created_at TEXT NOT NULL,
                UNIQUE (code, user_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_deposits_user ON deposits(user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_withdrawals_user_status ON withdrawals(user_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_games_user ON games(user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_games_kind ON games(kind)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ===== Users =====

    pub async fn get_or_create_user(&self, id: i64, username: Option<&str>) -> Result<UserRecord> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (id, username, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                username = COALESCE(excluded.username, users.username),
                updated_at = excluded.updated_at",
            params![id, username, now],
        )?;
        let user = conn.query_row("SELECT * FROM users WHERE id = ?1", [id], map_user)?;
        Ok(user)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().await;
        let user = conn
            .query_row("SELECT * FROM users WHERE id = ?1", [id], map_user)
            .optional()?;
        Ok(user)
    }

    pub async fn credit_balance(&self, user_id: i64, amount: Amount) -> Result<()> {
        let conn = self.conn.lock().await;
        credit_balance_tx(&conn, user_id, amount)
    }

    /// Conditional debit: succeeds only if the user is not blocked and the
    /// balance covers the amount. Returns false otherwise.
    pub async fn try_debit_balance(&self, user_id: i64, amount: Amount) -> Result<bool> {
        let conn = self.conn.lock().await;
        Ok(try_debit_tx(&conn, user_id, amount)? > 0)
    }

    pub async fn credit_referral_balance(&self, user_id: i64, amount: Amount) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE users SET referral_balance = referral_balance + ?1, updated_at = ?2
             WHERE id = ?3",
            params![amount, Utc::now().to_rfc3339(), user_id],
        )?;
        anyhow::ensure!(changed == 1, "user {} not found", user_id);
        Ok(())
    }

    /// Move the whole referral balance into the primary balance. Both sides
    /// in one statement so a concurrent claim can't double-pay.
    pub async fn claim_referral_balance(&self, user_id: i64) -> Result<Amount> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let amount: Amount = tx
            .query_row(
                "SELECT referral_balance FROM users WHERE id = ?1 AND is_blocked = 0",
                [user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if amount > 0 {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE users SET balance = balance + referral_balance,
                        referral_balance = 0, updated_at = ?1
                 WHERE id = ?2 AND referral_balance = ?3",
                params![now, user_id, amount],
            )?;
            tx.execute(
                "INSERT INTO referral_payouts (id, user_id, amount, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![uuid::Uuid::new_v4().to_string(), user_id, amount, now],
            )?;
        }
        tx.commit()?;
        Ok(amount)
    }

    pub async fn set_blocked(&self, user_id: i64, blocked: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET is_blocked = ?1, updated_at = ?2 WHERE id = ?3",
            params![blocked as i64, Utc::now().to_rfc3339(), user_id],
        )?;
        Ok(())
    }

    // ===== Deposits =====

    pub async fn insert_deposit(
        &self,
        user_id: i64,
        invoice_id: &str,
        amount: Amount,
    ) -> Result<DepositRecord> {
        let conn = self.conn.lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO deposits (id, user_id, invoice_id, amount, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, user_id, invoice_id, amount, now.to_rfc3339()],
        )?;
        Ok(DepositRecord {
            id,
            user_id,
            invoice_id: invoice_id.to_string(),
            amount,
            net_amount: 0,
            fee: 0,
            status: DepositStatus::Pending,
            created_at: now,
            paid_at: None,
        })
    }

    /// Gate `pending -> paid` and credit the user's balance with the net
    /// amount, atomically. Returns None when no pending deposit matches
    /// the invoice (duplicate webhook delivery included).
    pub async fn confirm_deposit(
        &self,
        invoice_id: &str,
        fee: Amount,
    ) -> Result<Option<DepositRecord>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let pending: Option<(String, i64, Amount)> = tx
            .query_row(
                "SELECT id, user_id, amount FROM deposits
                 WHERE invoice_id = ?1 AND status = 'pending'",
                [invoice_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, user_id, amount)) = pending else {
            return Ok(None);
        };
        let net = (amount - fee).max(0);

        tx.execute(
            "UPDATE deposits SET status = 'paid', net_amount = ?1, fee = ?2, paid_at = ?3
             WHERE id = ?4",
            params![net, fee, now, id],
        )?;
        tx.execute(
            "UPDATE users SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
            params![net, now, user_id],
        )?;
        tx.commit()?;

        let conn = conn;
        let record = conn.query_row("SELECT * FROM deposits WHERE id = ?1", [id], map_deposit)?;
        Ok(Some(record))
    }

    pub async fn get_deposit_by_invoice(&self, invoice_id: &str) -> Result<Option<DepositRecord>> {
        let conn = self.conn.lock().await;
        let rec = conn
            .query_row(
                "SELECT * FROM deposits WHERE invoice_id = ?1",
                [invoice_id],
                map_deposit,
            )
            .optional()?;
        Ok(rec)
    }

    // ===== Withdrawals =====

    /// Debit the user and create the withdrawal record in one transaction.
    /// The in-flight check lives inside the same transaction, so two
    /// concurrent requests cannot both pass it.
    pub async fn create_withdrawal(
        &self,
        user_id: i64,
        amount: Amount,
        net_amount: Amount,
        fee: Amount,
        recipient: &str,
        requires_approval: bool,
    ) -> Result<CreateWithdrawalOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM withdrawals
             WHERE user_id = ?1 AND status IN ('pending', 'approved', 'processing')",
            [user_id],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Ok(CreateWithdrawalOutcome::InFlightExists);
        }

        if try_debit_tx(&tx, user_id, amount)? == 0 {
            return Ok(CreateWithdrawalOutcome::InsufficientFunds);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let status = if requires_approval {
            WithdrawalStatus::Pending
        } else {
            WithdrawalStatus::Approved
        };
        tx.execute(
            "INSERT INTO withdrawals
               (id, user_id, amount, net_amount, fee, recipient, status,
                requires_approval, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                user_id,
                amount,
                net_amount,
                fee,
                recipient,
                status.as_str(),
                requires_approval as i64,
                now.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(CreateWithdrawalOutcome::Created(WithdrawalRecord {
            id,
            user_id,
            amount,
            net_amount,
            fee,
            recipient: recipient.to_string(),
            status,
            requires_approval,
            transfer_id: None,
            failure_reason: None,
            refunded: false,
            created_at: now,
            updated_at: now,
        }))
    }

    pub async fn get_withdrawal(&self, id: &str) -> Result<Option<WithdrawalRecord>> {
        let conn = self.conn.lock().await;
        let rec = conn
            .query_row(
                "SELECT * FROM withdrawals WHERE id = ?1",
                [id],
                map_withdrawal,
            )
            .optional()?;
        Ok(rec)
    }

    /// Status-gated transition. Returns false when the record was not in
    /// one of the expected source states (lost race, double delivery).
    pub async fn transition_withdrawal(
        &self,
        id: &str,
        from: &[WithdrawalStatus],
        to: WithdrawalStatus,
        transfer_id: Option<&str>,
    ) -> Result<bool> {
        let placeholders = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            &format!(
                "UPDATE withdrawals SET status = ?1,
                        transfer_id = COALESCE(?2, transfer_id), updated_at = ?3
                 WHERE id = ?4 AND status IN ({placeholders})"
            ),
            params![to.as_str(), transfer_id, Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed == 1)
    }

    /// Terminal failure path: gate the status, record the reason and apply
    /// the compensating credit in ONE transaction. A debit without a
    /// guaranteed credit-back on failure must be impossible.
    pub async fn settle_withdrawal_with_refund(
        &self,
        id: &str,
        from: &[WithdrawalStatus],
        to: WithdrawalStatus,
        reason: &str,
    ) -> Result<bool> {
        let placeholders = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let row: Option<(i64, Amount)> = tx
            .query_row(
                &format!(
                    "SELECT user_id, amount FROM withdrawals
                     WHERE id = ?1 AND status IN ({placeholders})"
                ),
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((user_id, amount)) = row else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE withdrawals SET status = ?1, failure_reason = ?2,
                    refunded = 1, updated_at = ?3
             WHERE id = ?4",
            params![to.as_str(), reason, now, id],
        )?;
        credit_balance_tx(&tx, user_id, amount)?;
        tx.commit()?;
        Ok(true)
    }

    // ===== Games =====

    pub async fn insert_game(&self, game: &GameRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO games
               (id, user_id, kind, bet, won, profit, roll, server_seed_hash, nonce, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                game.id,
                game.user_id,
                game.kind.as_str(),
                game.bet,
                game.won as i64,
                game.profit,
                game.roll,
                game.server_seed_hash,
                game.nonce.map(|n| n as i64),
                game.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ===== Duels =====

    pub async fn create_duel(
        &self,
        creator_id: i64,
        stake: Amount,
    ) -> Result<DebitOutcome<DuelRecord>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if try_debit_tx(&tx, creator_id, stake)? == 0 {
            return Ok(DebitOutcome::InsufficientFunds);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO duels (id, creator_id, stake, status, created_at)
             VALUES (?1, ?2, ?3, 'open', ?4)",
            params![id, creator_id, stake, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(DebitOutcome::Ok(DuelRecord {
            id,
            creator_id,
            opponent_id: None,
            stake,
            commission: 0,
            winner_id: None,
            status: DuelStatus::Open,
            created_at: now,
            settled_at: None,
        }))
    }

    pub async fn join_duel(&self, duel_id: &str, opponent_id: i64) -> Result<JoinDuelOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row: Option<(i64, Amount, String)> = tx
            .query_row(
                "SELECT creator_id, stake, status FROM duels WHERE id = ?1",
                [duel_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((creator_id, stake, status)) = row else {
            return Ok(JoinDuelOutcome::NotOpen);
        };
        if status != "open" {
            return Ok(JoinDuelOutcome::NotOpen);
        }
        if creator_id == opponent_id {
            return Ok(JoinDuelOutcome::SelfJoin);
        }
        if try_debit_tx(&tx, opponent_id, stake)? == 0 {
            return Ok(JoinDuelOutcome::InsufficientFunds);
        }

        tx.execute(
            "UPDATE duels SET opponent_id = ?1, status = 'active' WHERE id = ?2 AND status = 'open'",
            params![opponent_id, duel_id],
        )?;
        tx.commit()?;

        let conn = conn;
        let duel = conn.query_row("SELECT * FROM duels WHERE id = ?1", [duel_id], map_duel)?;
        Ok(JoinDuelOutcome::Joined(duel))
    }

    /// Gate `active -> completed`, credit the winner's payout and stamp the
    /// commission, atomically.
    pub async fn settle_duel(
        &self,
        duel_id: &str,
        winner_id: i64,
        payout: Amount,
        commission: Amount,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE duels SET status = 'completed', winner_id = ?1, commission = ?2,
                    settled_at = ?3
             WHERE id = ?4 AND status = 'active'",
            params![winner_id, commission, Utc::now().to_rfc3339(), duel_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        credit_balance_tx(&tx, winner_id, payout)?;
        tx.commit()?;
        Ok(true)
    }

    /// Gate `open -> cancelled` and refund the creator's escrowed stake.
    pub async fn cancel_duel(&self, duel_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let row: Option<(i64, Amount)> = tx
            .query_row(
                "SELECT creator_id, stake FROM duels WHERE id = ?1 AND status = 'open'",
                [duel_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((creator_id, stake)) = row else {
            return Ok(false);
        };
        tx.execute(
            "UPDATE duels SET status = 'cancelled' WHERE id = ?1 AND status = 'open'",
            [duel_id],
        )?;
        credit_balance_tx(&tx, creator_id, stake)?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn get_duel(&self, duel_id: &str) -> Result<Option<DuelRecord>> {
        let conn = self.conn.lock().await;
        let duel = conn
            .query_row("SELECT * FROM duels WHERE id = ?1", [duel_id], map_duel)
            .optional()?;
        Ok(duel)
    }

    // ===== Event bets =====

    pub async fn place_event_bet(
        &self,
        user_id: i64,
        event_id: &str,
        selection: &str,
        stake: Amount,
    ) -> Result<DebitOutcome<EventBetRecord>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if try_debit_tx(&tx, user_id, stake)? == 0 {
            return Ok(DebitOutcome::InsufficientFunds);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO event_bets (id, user_id, event_id, selection, stake, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
            params![id, user_id, event_id, selection, stake, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(DebitOutcome::Ok(EventBetRecord {
            id,
            user_id,
            event_id: event_id.to_string(),
            selection: selection.to_string(),
            stake,
            payout: 0,
            status: EventBetStatus::Open,
            created_at: now,
            settled_at: None,
        }))
    }

    /// Gate `open -> won/lost` and credit the payout when the bet won.
    /// Returns the settled record, or None when the bet was not open.
    pub async fn settle_event_bet(
        &self,
        bet_id: &str,
        won: bool,
        payout: Amount,
    ) -> Result<Option<EventBetRecord>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row: Option<i64> = tx
            .query_row(
                "SELECT user_id FROM event_bets WHERE id = ?1 AND status = 'open'",
                [bet_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(user_id) = row else {
            return Ok(None);
        };

        let status = if won { EventBetStatus::Won } else { EventBetStatus::Lost };
        let payout = if won { payout } else { 0 };
        tx.execute(
            "UPDATE event_bets SET status = ?1, payout = ?2, settled_at = ?3 WHERE id = ?4",
            params![status.as_str(), payout, Utc::now().to_rfc3339(), bet_id],
        )?;
        if payout > 0 {
            credit_balance_tx(&tx, user_id, payout)?;
        }
        tx.commit()?;

        let conn = conn;
        let rec = conn.query_row(
            "SELECT * FROM event_bets WHERE id = ?1",
            [bet_id],
            map_event_bet,
        )?;
        Ok(Some(rec))
    }

    /// Gate `open -> refunded` and return the stake (cancelled events).
    pub async fn refund_event_bet(&self, bet_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let row: Option<(i64, Amount)> = tx
            .query_row(
                "SELECT user_id, stake FROM event_bets WHERE id = ?1 AND status = 'open'",
                [bet_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((user_id, stake)) = row else {
            return Ok(false);
        };
        tx.execute(
            "UPDATE event_bets SET status = 'refunded', settled_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), bet_id],
        )?;
        credit_balance_tx(&tx, user_id, stake)?;
        tx.commit()?;
        Ok(true)
    }

    // ===== Promo codes =====

    pub async fn create_promo_code(
        &self,
        code: &str,
        value: Amount,
        max_activations: i64,
    ) -> Result<PromoCode> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO promo_codes (code, kind, value, max_activations, created_at)
             VALUES (?1, 'balance', ?2, ?3, ?4)",
            params![code, value, max_activations, now.to_rfc3339()],
        )?;
        Ok(PromoCode {
            code: code.to_string(),
            kind: "balance".to_string(),
            value,
            max_activations,
            activations: 0,
            created_at: now,
        })
    }

    /// All guards (code exists, activation budget, one redemption per
    /// user) and the credit run inside one transaction.
    pub async fn redeem_promo(&self, code: &str, user_id: i64) -> Result<RedeemOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let row: Option<(Amount, i64, i64)> = tx
            .query_row(
                "SELECT value, max_activations, activations FROM promo_codes
                 WHERE code = ?1 AND kind = 'balance'",
                [code],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((value, max_activations, activations)) = row else {
            return Ok(RedeemOutcome::UnknownCode);
        };
        if activations >= max_activations {
            return Ok(RedeemOutcome::Exhausted);
        }

        let already: i64 = tx.query_row(
            "SELECT COUNT(*) FROM promo_redemptions WHERE code = ?1 AND user_id = ?2",
            params![code, user_id],
            |row| row.get(0),
        )?;
        if already > 0 {
            return Ok(RedeemOutcome::AlreadyRedeemed);
        }

        tx.execute(
            "INSERT INTO promo_redemptions (id, code, user_id, value, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'completed', ?5)",
            params![uuid::Uuid::new_v4().to_string(), code, user_id, value, now],
        )?;
        tx.execute(
            "UPDATE promo_codes SET activations = activations + 1 WHERE code = ?1",
            [code],
        )?;
        credit_balance_tx(&tx, user_id, value)?;
        tx.commit()?;
        Ok(RedeemOutcome::Redeemed { value })
    }

    // ===== Recalculation aggregates =====

    /// Sum of primary + referral balances over non-blocked users.
    pub async fn sum_user_liabilities(&self) -> Result<Amount> {
        let conn = self.conn.lock().await;
        let sum: Amount = conn.query_row(
            "SELECT COALESCE(SUM(balance + referral_balance), 0) FROM users WHERE is_blocked = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    /// (gross, fees) over deposits with status = paid.
    pub async fn sum_paid_deposits(&self) -> Result<(Amount, Amount)> {
        let conn = self.conn.lock().await;
        let row = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0), COALESCE(SUM(fee), 0)
             FROM deposits WHERE status = 'paid'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(row)
    }

    /// (gross, fees) over withdrawals with status = completed.
    pub async fn sum_completed_withdrawals(&self) -> Result<(Amount, Amount)> {
        let conn = self.conn.lock().await;
        let row = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0), COALESCE(SUM(fee), 0)
             FROM withdrawals WHERE status = 'completed'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(row)
    }

    /// Per-kind bets, wins (stake + profit for won rounds) and counts.
    pub async fn game_aggregates(&self) -> Result<HashMap<GameKind, GameAggregate>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT kind, COALESCE(SUM(bet), 0),
                    COALESCE(SUM(CASE WHEN won = 1 THEN bet + profit ELSE 0 END), 0),
                    COUNT(*)
             FROM games GROUP BY kind",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Amount>(1)?,
                row.get::<_, Amount>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (kind, total_bets, total_wins, total_games) = row?;
            let Some(kind) = GameKind::parse(&kind) else {
                continue;
            };
            out.insert(
                kind,
                GameAggregate {
                    total_bets,
                    total_wins,
                    total_games: total_games as u64,
                },
            );
        }
        Ok(out)
    }

    /// House edge on settled event bets: stakes kept minus payouts made.
    /// Negative when the events book lost money.
    pub async fn sum_event_commission(&self) -> Result<Amount> {
        let conn = self.conn.lock().await;
        let sum: Amount = conn.query_row(
            "SELECT COALESCE(SUM(stake - payout), 0) FROM event_bets
             WHERE status IN ('won', 'lost')",
            [],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub async fn sum_completed_duel_commissions(&self) -> Result<Amount> {
        let conn = self.conn.lock().await;
        let sum: Amount = conn.query_row(
            "SELECT COALESCE(SUM(commission), 0) FROM duels WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub async fn sum_promo_redemptions(&self) -> Result<Amount> {
        let conn = self.conn.lock().await;
        let sum: Amount = conn.query_row(
            "SELECT COALESCE(SUM(value), 0) FROM promo_redemptions WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub async fn insert_owner_withdrawal(
        &self,
        amount: Amount,
        transfer_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO owner_withdrawals (id, amount, transfer_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                uuid::Uuid::new_v4().to_string(),
                amount,
                transfer_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn sum_owner_withdrawals(&self) -> Result<Amount> {
        let conn = self.conn.lock().await;
        let sum: Amount = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM owner_withdrawals",
            [],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub async fn sum_referral_payouts(&self) -> Result<Amount> {
        let conn = self.conn.lock().await;
        let sum: Amount = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM referral_payouts",
            [],
            |row| row.get(0),
        )?;
        Ok(sum)
    }
}

// ===== Row mappers & shared statements =====

fn credit_balance_tx(conn: &Connection, user_id: i64, amount: Amount) -> Result<()> {
    let changed = conn.execute(
        "UPDATE users SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
        params![amount, Utc::now().to_rfc3339(), user_id],
    )?;
    anyhow::ensure!(changed == 1, "user {} not found for credit", user_id);
    Ok(())
}

/// The conditional-debit statement. Returns the number of rows changed:
/// 0 means blocked user, unknown user, or insufficient balance.
fn try_debit_tx(conn: &Connection, user_id: i64, amount: Amount) -> Result<usize> {
    anyhow::ensure!(amount > 0, "debit amount must be positive");
    let changed = conn.execute(
        "UPDATE users SET balance = balance - ?1, updated_at = ?2
         WHERE id = ?3 AND is_blocked = 0 AND balance >= ?1",
        params![amount, Utc::now().to_rfc3339(), user_id],
    )?;
    Ok(changed)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        balance: row.get(2)?,
        referral_balance: row.get(3)?,
        referrer_id: row.get(4)?,
        is_blocked: row.get::<_, i64>(5)? == 1,
        created_at: parse_ts(&row.get::<_, String>(6)?),
        updated_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

fn map_deposit(row: &Row<'_>) -> rusqlite::Result<DepositRecord> {
    Ok(DepositRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        invoice_id: row.get(2)?,
        amount: row.get(3)?,
        net_amount: row.get(4)?,
        fee: row.get(5)?,
        status: DepositStatus::parse(&row.get::<_, String>(6)?).unwrap_or(DepositStatus::Failed),
        created_at: parse_ts(&row.get::<_, String>(7)?),
        paid_at: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
    })
}

fn map_withdrawal(row: &Row<'_>) -> rusqlite::Result<WithdrawalRecord> {
    Ok(WithdrawalRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        net_amount: row.get(3)?,
        fee: row.get(4)?,
        recipient: row.get(5)?,
        status: WithdrawalStatus::parse(&row.get::<_, String>(6)?)
            .unwrap_or(WithdrawalStatus::Failed),
        requires_approval: row.get::<_, i64>(7)? == 1,
        transfer_id: row.get(8)?,
        failure_reason: row.get(9)?,
        refunded: row.get::<_, i64>(10)? == 1,
        created_at: parse_ts(&row.get::<_, String>(11)?),
        updated_at: parse_ts(&row.get::<_, String>(12)?),
    })
}

fn map_duel(row: &Row<'_>) -> rusqlite::Result<DuelRecord> {
    Ok(DuelRecord {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        opponent_id: row.get(2)?,
        stake: row.get(3)?,
        commission: row.get(4)?,
        winner_id: row.get(5)?,
        status: DuelStatus::parse(&row.get::<_, String>(6)?).unwrap_or(DuelStatus::Cancelled),
        created_at: parse_ts(&row.get::<_, String>(7)?),
        settled_at: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
    })
}

fn map_event_bet(row: &Row<'_>) -> rusqlite::Result<EventBetRecord> {
    Ok(EventBetRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        event_id: row.get(2)?,
        selection: row.get(3)?,
        stake: row.get(4)?,
        payout: row.get(5)?,
        status: EventBetStatus::parse(&row.get::<_, String>(6)?)
            .unwrap_or(EventBetStatus::Refunded),
        created_at: parse_ts(&row.get::<_, String>(7)?),
        settled_at: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
