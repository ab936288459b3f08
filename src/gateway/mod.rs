//! External payment gateway seam.
//!
//! The gateway is the custodian of real funds; this crate only ever talks
//! to it through the `PaymentGateway` trait so settlement workflows and
//! the reconciliation engine can be tested against scripted
//! implementations. The production implementation (cryptopay.rs) speaks
//! the Crypto Pay HTTP API.

pub mod cryptopay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ledger::amount::Amount;

/// Named gateway failures. Settlement code branches on these: everything
/// except `Unavailable` is a definitive rejection, `Unavailable` means the
/// outcome is unknown and the compensation path decides.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway has insufficient funds")]
    InsufficientFunds,

    #[error("unknown recipient")]
    UnknownRecipient,

    #[error("duplicate idempotency key")]
    DuplicateIdempotencyKey,

    #[error("gateway rate limit exceeded")]
    RateLimited,

    #[error("gateway rejected request: {0}")]
    Rejected(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Custodial balance for one asset as the gateway reports it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GatewayBalance {
    pub available: Amount,
    pub onhold: Amount,
    pub total: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub amount: Amount,
    pub fee: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceHandle {
    pub invoice_id: String,
    pub pay_url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Balance oracle for one asset.
    async fn get_balance(&self, asset: &str) -> Result<GatewayBalance, GatewayError>;

    /// Push funds to an external recipient. `idempotency_key` must be
    /// stable across retries of the same logical transfer.
    async fn transfer(
        &self,
        recipient_id: i64,
        asset: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<TransferReceipt, GatewayError>;

    /// Open a deposit invoice the user pays through the gateway.
    async fn create_invoice(
        &self,
        asset: &str,
        amount: Amount,
        description: &str,
    ) -> Result<InvoiceHandle, GatewayError>;
}
