//! Deposit lifecycle.
//!
//! A deposit starts as a gateway invoice and a `pending` record. The
//! gateway webhook drives confirmation: the record gates `pending ->
//! paid` exactly once, the user is credited net of the gateway fee, and
//! the ledger operation runs. Duplicate webhook deliveries fall through
//! the status gate and change nothing.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::casino::db::{CasinoDb, DepositRecord};
use crate::gateway::{GatewayError, PaymentGateway};
use crate::ledger::amount::{to_amount, Amount};
use crate::ledger::operations::LedgerService;

#[derive(Debug, Clone)]
pub struct DepositConfig {
    pub asset: String,
    pub min_amount: Amount,
    pub max_amount: Amount,
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            asset: "USDT".to_string(),
            min_amount: to_amount(1.0),
            max_amount: to_amount(10_000.0),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DepositError {
    #[error("amount out of bounds")]
    InvalidAmount,

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Ledger(#[from] crate::ledger::operations::LedgerOpError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingDeposit {
    pub deposit: DepositRecord,
    pub pay_url: String,
}

pub struct DepositService {
    db: CasinoDb,
    ledger: Arc<LedgerService>,
    gateway: Arc<dyn PaymentGateway>,
    config: DepositConfig,
}

impl DepositService {
    pub fn new(
        db: CasinoDb,
        ledger: Arc<LedgerService>,
        gateway: Arc<dyn PaymentGateway>,
        config: DepositConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            gateway,
            config,
        }
    }

    /// Open an invoice for the user to pay. Nothing is credited here.
    pub async fn create(
        &self,
        user_id: i64,
        amount: Amount,
    ) -> Result<PendingDeposit, DepositError> {
        if amount < self.config.min_amount || amount > self.config.max_amount {
            return Err(DepositError::InvalidAmount);
        }
        self.db.get_or_create_user(user_id, None).await?;

        let invoice = self
            .gateway
            .create_invoice(
                &self.config.asset,
                amount,
                &format!("Deposit for user {}", user_id),
            )
            .await?;
        let deposit = self
            .db
            .insert_deposit(user_id, &invoice.invoice_id, amount)
            .await?;

        info!(user_id, invoice_id = %invoice.invoice_id, amount, "deposit invoice created");
        Ok(PendingDeposit {
            deposit,
            pay_url: invoice.pay_url,
        })
    }

    /// Webhook entry point: the invoice was paid at the gateway. Returns
    /// the settled record, or None for an unknown or already-settled
    /// invoice.
    pub async fn confirm(
        &self,
        invoice_id: &str,
        fee: Amount,
    ) -> Result<Option<DepositRecord>, DepositError> {
        let Some(record) = self.db.confirm_deposit(invoice_id, fee).await? else {
            warn!(invoice_id, "deposit confirmation ignored (unknown or duplicate)");
            return Ok(None);
        };

        self.ledger
            .record_deposit_confirmed(record.amount, record.net_amount, record.fee)
            .await?;

        info!(
            invoice_id,
            user_id = record.user_id,
            gross = record.amount,
            net = record.net_amount,
            "deposit confirmed"
        );
        Ok(Some(record))
    }
}
