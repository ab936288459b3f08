//! Withdrawal state machine.
//!
//! `pending -> approved -> processing -> completed`, with
//! `pending -> rejected` and `processing -> failed` branches. Every
//! transition is a status-gated UPDATE, so double deliveries and races
//! resolve to exactly one effect.
//!
//! The one rule that dominates this file: once the user's balance has
//! been debited, every path that does not end in `completed` MUST apply
//! the compensating credit. Failure-marking and the refund are a single
//! database transaction; a debit can never be stranded by a crash between
//! the two.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::casino::db::{
    CasinoDb, CreateWithdrawalOutcome, WithdrawalRecord, WithdrawalStatus,
};
use crate::gateway::{GatewayError, PaymentGateway};
use crate::ledger::amount::{percent_of, to_amount, Amount};
use crate::ledger::operations::LedgerService;

#[derive(Debug, Clone)]
pub struct WithdrawalConfig {
    pub asset: String,
    pub min_amount: Amount,
    pub max_amount: Amount,
    /// At or above this amount the withdrawal waits for manual approval.
    pub approval_threshold: Amount,
    /// Display percent of headroom the gateway must hold over the amount
    /// (105.0 == amount x 1.05).
    pub solvency_margin_pct: f64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            asset: "USDT".to_string(),
            min_amount: to_amount(1.0),
            max_amount: to_amount(5_000.0),
            approval_threshold: to_amount(100.0),
            solvency_margin_pct: 105.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WithdrawalError {
    #[error("amount out of bounds")]
    InvalidAmount,

    #[error("recipient must be a numeric account id")]
    InvalidRecipient,

    #[error("another withdrawal is already in flight")]
    InFlightExists,

    #[error("insufficient balance")]
    InsufficientFunds,

    #[error("gateway lacks solvency headroom for this amount")]
    InsufficientGatewayHeadroom,

    #[error("withdrawal not found")]
    NotFound,

    #[error("withdrawal is not in a state that allows this transition")]
    InvalidState,

    #[error("only the owner of the withdrawal may cancel it")]
    NotOwner,

    #[error(transparent)]
    Ledger(#[from] crate::ledger::operations::LedgerOpError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    pub withdrawal: WithdrawalRecord,
    /// Set when the withdrawal waits for manual approval.
    pub awaiting_approval: bool,
}

pub struct WithdrawalService {
    db: CasinoDb,
    ledger: Arc<LedgerService>,
    gateway: Arc<dyn PaymentGateway>,
    config: WithdrawalConfig,
}

impl WithdrawalService {
    pub fn new(
        db: CasinoDb,
        ledger: Arc<LedgerService>,
        gateway: Arc<dyn PaymentGateway>,
        config: WithdrawalConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            gateway,
            config,
        }
    }

    /// Create a withdrawal: validate, check gateway headroom, debit the
    /// user and insert the record atomically. Small amounts continue
    /// straight into processing; large ones stop at `pending`.
    pub async fn request(
        &self,
        user_id: i64,
        amount: Amount,
        recipient: &str,
    ) -> Result<WithdrawalReceipt, WithdrawalError> {
        if amount < self.config.min_amount || amount > self.config.max_amount {
            return Err(WithdrawalError::InvalidAmount);
        }
        let recipient = recipient.trim();
        if recipient.parse::<i64>().map(|id| id <= 0).unwrap_or(true) {
            return Err(WithdrawalError::InvalidRecipient);
        }

        // Solvency headroom before any debit: the gateway must be able to
        // cover this transfer with margin to spare.
        let balance = self.gateway.get_balance(&self.config.asset).await;
        match balance {
            Ok(balance) => {
                let required = percent_of(amount, self.config.solvency_margin_pct);
                if balance.available < required {
                    warn!(
                        amount,
                        available = balance.available,
                        required,
                        "withdrawal refused: gateway headroom too thin"
                    );
                    return Err(WithdrawalError::InsufficientGatewayHeadroom);
                }
            }
            Err(e) => {
                // Unknown solvency is treated as no solvency.
                warn!(error = %e, "withdrawal refused: gateway balance unavailable");
                return Err(WithdrawalError::InsufficientGatewayHeadroom);
            }
        }

        let requires_approval = amount >= self.config.approval_threshold;
        let record = match self
            .db
            .create_withdrawal(user_id, amount, amount, 0, recipient, requires_approval)
            .await?
        {
            CreateWithdrawalOutcome::Created(record) => record,
            CreateWithdrawalOutcome::InFlightExists => {
                return Err(WithdrawalError::InFlightExists)
            }
            CreateWithdrawalOutcome::InsufficientFunds => {
                return Err(WithdrawalError::InsufficientFunds)
            }
        };

        info!(
            withdrawal_id = %record.id,
            user_id,
            amount,
            requires_approval,
            "withdrawal created"
        );

        if requires_approval {
            return Ok(WithdrawalReceipt {
                withdrawal: record,
                awaiting_approval: true,
            });
        }

        let settled = self.process(&record.id).await?;
        Ok(WithdrawalReceipt {
            withdrawal: settled,
            awaiting_approval: false,
        })
    }

    /// Manual approval of a pending withdrawal, then processing.
    pub async fn approve(&self, id: &str) -> Result<WithdrawalRecord, WithdrawalError> {
        if !self
            .db
            .transition_withdrawal(
                id,
                &[WithdrawalStatus::Pending],
                WithdrawalStatus::Approved,
                None,
            )
            .await?
        {
            return Err(WithdrawalError::InvalidState);
        }
        info!(withdrawal_id = id, "withdrawal approved");
        self.process(id).await
    }

    /// Manual rejection of a pending withdrawal. Refunds the user.
    pub async fn reject(&self, id: &str, reason: &str) -> Result<(), WithdrawalError> {
        if !self
            .db
            .settle_withdrawal_with_refund(
                id,
                &[WithdrawalStatus::Pending],
                WithdrawalStatus::Rejected,
                reason,
            )
            .await?
        {
            return Err(WithdrawalError::InvalidState);
        }
        info!(withdrawal_id = id, reason, "withdrawal rejected and refunded");
        Ok(())
    }

    /// User-initiated cancellation: allowed only from `pending`,
    /// implemented as a rejection with the user's reason.
    pub async fn cancel(
        &self,
        id: &str,
        user_id: i64,
        reason: &str,
    ) -> Result<(), WithdrawalError> {
        let record = self
            .db
            .get_withdrawal(id)
            .await?
            .ok_or(WithdrawalError::NotFound)?;
        if record.user_id != user_id {
            return Err(WithdrawalError::NotOwner);
        }
        self.reject(id, reason).await
    }

    /// Drive an approved withdrawal through the external transfer.
    pub async fn process(&self, id: &str) -> Result<WithdrawalRecord, WithdrawalError> {
        if !self
            .db
            .transition_withdrawal(
                id,
                &[WithdrawalStatus::Approved],
                WithdrawalStatus::Processing,
                None,
            )
            .await?
        {
            return Err(WithdrawalError::InvalidState);
        }
        let record = self
            .db
            .get_withdrawal(id)
            .await?
            .ok_or(WithdrawalError::NotFound)?;
        let recipient_id: i64 = record
            .recipient
            .parse()
            .map_err(|_| WithdrawalError::InvalidRecipient)?;

        // The withdrawal id doubles as the idempotency key: a crashed and
        // retried processing run cannot pay twice.
        let transfer = self
            .gateway
            .transfer(recipient_id, &self.config.asset, record.net_amount, &record.id)
            .await;

        match transfer {
            Ok(receipt) => {
                self.db
                    .transition_withdrawal(
                        id,
                        &[WithdrawalStatus::Processing],
                        WithdrawalStatus::Completed,
                        Some(&receipt.transfer_id),
                    )
                    .await?;
                self.ledger
                    .record_withdrawal_completed(record.amount, receipt.fee)
                    .await?;
                info!(
                    withdrawal_id = id,
                    transfer_id = %receipt.transfer_id,
                    "withdrawal completed"
                );
            }
            Err(GatewayError::DuplicateIdempotencyKey) => {
                // A previous attempt already paid out; converge on
                // completed without a second ledger operation only if the
                // record never reached it. The status gate decides.
                if self
                    .db
                    .transition_withdrawal(
                        id,
                        &[WithdrawalStatus::Processing],
                        WithdrawalStatus::Completed,
                        None,
                    )
                    .await?
                {
                    self.ledger
                        .record_withdrawal_completed(record.amount, 0)
                        .await?;
                    warn!(withdrawal_id = id, "transfer already existed; converged to completed");
                }
            }
            Err(e) => {
                error!(withdrawal_id = id, error = %e, "transfer failed; refunding");
                self.db
                    .settle_withdrawal_with_refund(
                        id,
                        &[WithdrawalStatus::Processing],
                        WithdrawalStatus::Failed,
                        &e.to_string(),
                    )
                    .await?;
            }
        }

        self.db
            .get_withdrawal(id)
            .await?
            .ok_or(WithdrawalError::NotFound)
    }
}
