//! PvP duels.
//!
//! Escrow model: both stakes leave the players' balances before anything
//! is decided. Settlement is a provably-fair coinflip; the winner takes
//! the pot minus the house commission, and the commission is the only
//! ledger-visible economics of the duel.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::casino::db::{CasinoDb, DebitOutcome, DuelRecord, JoinDuelOutcome};
use crate::casino::fair::FairRoller;
use crate::ledger::amount::{percent_of, to_amount, Amount};
use crate::ledger::operations::LedgerService;

#[derive(Debug, Clone)]
pub struct DuelConfig {
    pub min_stake: Amount,
    pub max_stake: Amount,
    /// Display percent of the pot the house keeps (5.0 == 5%).
    pub commission_pct: f64,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            min_stake: to_amount(0.5),
            max_stake: to_amount(500.0),
            commission_pct: 5.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DuelError {
    #[error("stake out of bounds")]
    InvalidStake,

    #[error("insufficient balance")]
    InsufficientFunds,

    #[error("duel is not open")]
    NotOpen,

    #[error("cannot join own duel")]
    SelfJoin,

    #[error("duel not found")]
    NotFound,

    #[error("only the creator may cancel")]
    NotCreator,

    #[error(transparent)]
    Ledger(#[from] crate::ledger::operations::LedgerOpError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct DuelResult {
    pub duel: DuelRecord,
    pub winner_id: i64,
    pub payout: Amount,
    pub commission: Amount,
    pub roll: f64,
}

pub struct DuelService {
    db: CasinoDb,
    ledger: Arc<LedgerService>,
    fair: Arc<FairRoller>,
    config: DuelConfig,
}

impl DuelService {
    pub fn new(
        db: CasinoDb,
        ledger: Arc<LedgerService>,
        fair: Arc<FairRoller>,
        config: DuelConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            fair,
            config,
        }
    }

    /// Open a duel, escrowing the creator's stake.
    pub async fn create(&self, creator_id: i64, stake: Amount) -> Result<DuelRecord, DuelError> {
        if stake < self.config.min_stake || stake > self.config.max_stake {
            return Err(DuelError::InvalidStake);
        }
        match self.db.create_duel(creator_id, stake).await? {
            DebitOutcome::Ok(duel) => {
                debug!(duel_id = %duel.id, creator_id, stake, "duel opened");
                Ok(duel)
            }
            DebitOutcome::InsufficientFunds | DebitOutcome::Blocked => {
                Err(DuelError::InsufficientFunds)
            }
        }
    }

    /// Join and settle in one step: escrow the opponent's stake, flip,
    /// pay the winner pot minus commission, record the commission.
    pub async fn join_and_settle(
        &self,
        duel_id: &str,
        opponent_id: i64,
    ) -> Result<DuelResult, DuelError> {
        let duel = match self.db.join_duel(duel_id, opponent_id).await? {
            JoinDuelOutcome::Joined(duel) => duel,
            JoinDuelOutcome::NotOpen => return Err(DuelError::NotOpen),
            JoinDuelOutcome::SelfJoin => return Err(DuelError::SelfJoin),
            JoinDuelOutcome::InsufficientFunds => return Err(DuelError::InsufficientFunds),
        };

        let roll = self.fair.roll(&duel.id);
        let winner_id = if roll.value < 0.5 {
            duel.creator_id
        } else {
            opponent_id
        };

        let pot = duel.stake * 2;
        let commission = percent_of(pot, self.config.commission_pct);
        let payout = pot - commission;

        if !self
            .db
            .settle_duel(&duel.id, winner_id, payout, commission)
            .await?
        {
            return Err(DuelError::NotOpen);
        }
        self.ledger.record_duel_settled(commission).await?;

        info!(
            duel_id = %duel.id,
            winner_id,
            payout,
            commission,
            "duel settled"
        );

        let duel = self
            .db
            .get_duel(&duel.id)
            .await?
            .ok_or(DuelError::NotFound)?;
        Ok(DuelResult {
            duel,
            winner_id,
            payout,
            commission,
            roll: roll.value,
        })
    }

    /// Cancel an unjoined duel and release the escrow. Creator only.
    pub async fn cancel(&self, duel_id: &str, by_user: i64) -> Result<(), DuelError> {
        let duel = self
            .db
            .get_duel(duel_id)
            .await?
            .ok_or(DuelError::NotFound)?;
        if duel.creator_id != by_user {
            return Err(DuelError::NotCreator);
        }
        if !self.db.cancel_duel(duel_id).await? {
            return Err(DuelError::NotOpen);
        }
        debug!(duel_id, "duel cancelled, stake refunded");
        Ok(())
    }
}
