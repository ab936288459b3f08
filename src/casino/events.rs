//! Event bet settlement.
//!
//! Event CRUD (schedules, markets, odds) lives with the operators; this
//! service owns only the money motion: stake escrow on placement, payout
//! and ledger commission on settlement, refund on cancellation. The net
//! house edge per settled bet is what reaches the ledger.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::casino::db::{CasinoDb, DebitOutcome, EventBetRecord};
use crate::ledger::amount::{to_amount, Amount};
use crate::ledger::operations::LedgerService;

#[derive(Debug, Clone)]
pub struct EventBetConfig {
    pub min_stake: Amount,
    pub max_stake: Amount,
}

impl Default for EventBetConfig {
    fn default() -> Self {
        Self {
            min_stake: to_amount(0.5),
            max_stake: to_amount(2_000.0),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBetError {
    #[error("stake out of bounds")]
    InvalidStake,

    #[error("insufficient balance")]
    InsufficientFunds,

    #[error("bet not found or already settled")]
    NotOpen,

    #[error(transparent)]
    Ledger(#[from] crate::ledger::operations::LedgerOpError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct EventBetService {
    db: CasinoDb,
    ledger: Arc<LedgerService>,
    config: EventBetConfig,
}

impl EventBetService {
    pub fn new(db: CasinoDb, ledger: Arc<LedgerService>, config: EventBetConfig) -> Self {
        Self { db, ledger, config }
    }

    pub async fn place(
        &self,
        user_id: i64,
        event_id: &str,
        selection: &str,
        stake: Amount,
    ) -> Result<EventBetRecord, EventBetError> {
        if stake < self.config.min_stake || stake > self.config.max_stake {
            return Err(EventBetError::InvalidStake);
        }
        match self
            .db
            .place_event_bet(user_id, event_id, selection, stake)
            .await?
        {
            DebitOutcome::Ok(bet) => {
                debug!(user_id, event_id, selection, stake, "event bet placed");
                Ok(bet)
            }
            DebitOutcome::InsufficientFunds | DebitOutcome::Blocked => {
                Err(EventBetError::InsufficientFunds)
            }
        }
    }

    /// Operator settlement of one bet. `payout` is the full amount
    /// returned to a winner (stake included). The realized house edge,
    /// positive or negative, flows to the ledger as events commission.
    pub async fn settle(
        &self,
        bet_id: &str,
        won: bool,
        payout: Amount,
    ) -> Result<EventBetRecord, EventBetError> {
        let record = self
            .db
            .settle_event_bet(bet_id, won, payout)
            .await?
            .ok_or(EventBetError::NotOpen)?;

        let net_commission = record.stake - record.payout;
        if net_commission != 0 {
            self.ledger.record_event_settled(net_commission).await?;
        }

        info!(
            bet_id,
            won,
            payout = record.payout,
            net_commission,
            "event bet settled"
        );
        Ok(record)
    }

    /// Cancelled event: release the escrowed stake, no ledger motion.
    pub async fn refund(&self, bet_id: &str) -> Result<(), EventBetError> {
        if !self.db.refund_event_bet(bet_id).await? {
            return Err(EventBetError::NotOpen);
        }
        debug!(bet_id, "event bet refunded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::operations::LedgerConfig;
    use crate::ledger::store::LedgerStore;

    async fn service() -> (tempfile::TempDir, CasinoDb, Arc<LedgerService>, EventBetService) {
        let dir = tempfile::tempdir().unwrap();
        let db = CasinoDb::new(dir.path().join("c.db").to_str().unwrap()).unwrap();
        let store = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        let ledger = LedgerService::open(store, LedgerConfig::default()).await.unwrap();
        let svc = EventBetService::new(db.clone(), ledger.clone(), EventBetConfig::default());
        (dir, db, ledger, svc)
    }

    async fn fund(db: &CasinoDb, ledger: &LedgerService, user: i64, coins: f64) {
        db.get_or_create_user(user, None).await.unwrap();
        db.credit_balance(user, to_amount(coins)).await.unwrap();
        ledger
            .record_deposit_confirmed(to_amount(coins), to_amount(coins), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lost_bet_is_positive_commission() {
        let (_d, db, ledger, svc) = service().await;
        fund(&db, &ledger, 1, 100.0).await;

        let bet = svc.place(1, "finals", "team_a", to_amount(20.0)).await.unwrap();
        svc.settle(&bet.id, false, 0).await.unwrap();

        let s = ledger.snapshot().await;
        assert_eq!(s.commission_breakdown.events, to_amount(20.0));
        assert_eq!(s.operational_balance, to_amount(20.0));
        assert_eq!(s.total_user_balance, to_amount(80.0));
        assert_eq!(db.sum_user_liabilities().await.unwrap(), to_amount(80.0));
    }

    #[tokio::test]
    async fn test_won_bet_is_negative_commission() {
        let (_d, db, ledger, svc) = service().await;
        fund(&db, &ledger, 1, 100.0).await;

        let bet = svc.place(1, "finals", "team_b", to_amount(10.0)).await.unwrap();
        // Paid at 2.5x: payout 25, house loses 15.
        svc.settle(&bet.id, true, to_amount(25.0)).await.unwrap();

        let s = ledger.snapshot().await;
        assert_eq!(s.commission_breakdown.events, to_amount(-15.0));
        assert_eq!(s.operational_balance, to_amount(-15.0));
        assert_eq!(db.get_user(1).await.unwrap().unwrap().balance, to_amount(115.0));
        assert_eq!(s.total_user_balance, to_amount(115.0));

        // Double settlement is refused by the status gate.
        assert!(matches!(
            svc.settle(&bet.id, true, to_amount(25.0)).await.unwrap_err(),
            EventBetError::NotOpen
        ));
    }

    #[tokio::test]
    async fn test_refund_releases_escrow_without_ledger_motion() {
        let (_d, db, ledger, svc) = service().await;
        fund(&db, &ledger, 1, 100.0).await;

        let bet = svc.place(1, "cancelled-match", "draw", to_amount(30.0)).await.unwrap();
        svc.refund(&bet.id).await.unwrap();

        assert_eq!(db.get_user(1).await.unwrap().unwrap().balance, to_amount(100.0));
        let s = ledger.snapshot().await;
        assert_eq!(s.commission_breakdown.events, 0);
        assert_eq!(s.operational_balance, 0);
    }
}
