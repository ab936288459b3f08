//! Promo codes and referral payouts.
//!
//! Balance-type promo redemptions mint a new obligation out of house
//! profit and run a ledger operation. Referral claims are an internal
//! transfer between two already-accounted balances; the ledger sees a
//! statistics counter and nothing else.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::casino::db::{CasinoDb, PromoCode, RedeemOutcome};
use crate::ledger::amount::Amount;
use crate::ledger::operations::LedgerService;

#[derive(Debug, thiserror::Error)]
pub enum PromoError {
    #[error("unknown promo code")]
    UnknownCode,

    #[error("promo code exhausted")]
    Exhausted,

    #[error("promo code already redeemed")]
    AlreadyRedeemed,

    #[error(transparent)]
    Ledger(#[from] crate::ledger::operations::LedgerOpError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct PromoService {
    db: CasinoDb,
    ledger: Arc<LedgerService>,
}

impl PromoService {
    pub fn new(db: CasinoDb, ledger: Arc<LedgerService>) -> Self {
        Self { db, ledger }
    }

    pub async fn create_code(
        &self,
        code: &str,
        value: Amount,
        max_activations: i64,
    ) -> Result<PromoCode> {
        self.db.create_promo_code(code, value, max_activations).await
    }

    /// Redeem a balance-type code for the user. Credit and guards are
    /// atomic in the database; the ledger operation follows.
    pub async fn redeem(&self, code: &str, user_id: i64) -> Result<Amount, PromoError> {
        let value = match self.db.redeem_promo(code, user_id).await? {
            RedeemOutcome::Redeemed { value } => value,
            RedeemOutcome::UnknownCode => return Err(PromoError::UnknownCode),
            RedeemOutcome::Exhausted => return Err(PromoError::Exhausted),
            RedeemOutcome::AlreadyRedeemed => return Err(PromoError::AlreadyRedeemed),
        };
        self.ledger.record_promo_redeemed(value).await?;
        info!(code, user_id, value, "promo redeemed");
        Ok(value)
    }

    /// Move the user's accrued referral balance into their primary
    /// balance. Returns the claimed amount (0 when nothing accrued).
    pub async fn claim_referral(&self, user_id: i64) -> Result<Amount, PromoError> {
        let amount = self.db.claim_referral_balance(user_id).await?;
        if amount > 0 {
            self.ledger.record_referral_payout(amount).await?;
            info!(user_id, amount, "referral balance claimed");
        }
        Ok(amount)
    }
}
