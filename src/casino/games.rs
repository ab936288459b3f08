//! RNG game settlement.
//!
//! One round: conditional stake debit, provably-fair roll, payout rule,
//! winner credit, game record, ledger operation. The balance check and
//! debit are a single atomic statement, so concurrent rounds against the
//! same balance can never overdraw it.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::casino::db::{CasinoDb, GameRecord};
use crate::casino::fair::FairRoller;
use crate::ledger::amount::{to_amount, Amount};
use crate::ledger::operations::LedgerService;
use crate::ledger::state::GameKind;

#[derive(Debug, Clone)]
pub struct GameConfig {
    pub min_bet: Amount,
    pub max_bet: Amount,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_bet: to_amount(0.1),
            max_bet: to_amount(1000.0),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("bet out of bounds")]
    InvalidBet,

    #[error("insufficient balance")]
    InsufficientFunds,

    #[error(transparent)]
    Ledger(#[from] crate::ledger::operations::LedgerOpError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct GameOutcome {
    pub game_id: String,
    pub kind: GameKind,
    pub bet: Amount,
    pub won: bool,
    /// Net win above the stake; 0 on loss.
    pub profit: Amount,
    /// Credited on win: stake + profit.
    pub payout: Amount,
    pub roll: f64,
    pub server_seed_hash: String,
    pub nonce: u64,
}

pub struct GameService {
    db: CasinoDb,
    ledger: Arc<LedgerService>,
    fair: Arc<FairRoller>,
    config: GameConfig,
}

impl GameService {
    pub fn new(
        db: CasinoDb,
        ledger: Arc<LedgerService>,
        fair: Arc<FairRoller>,
        config: GameConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            fair,
            config,
        }
    }

    pub async fn play(
        &self,
        user_id: i64,
        kind: GameKind,
        bet: Amount,
        client_seed: &str,
    ) -> Result<GameOutcome, GameError> {
        if bet < self.config.min_bet || bet > self.config.max_bet {
            return Err(GameError::InvalidBet);
        }

        if !self.db.try_debit_balance(user_id, bet).await? {
            return Err(GameError::InsufficientFunds);
        }

        let roll = self.fair.roll(client_seed);
        let (won, profit) = resolve(kind, roll.value, bet);
        let payout = if won { bet + profit } else { 0 };
        if payout > 0 {
            self.db.credit_balance(user_id, payout).await?;
        }

        let record = GameRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            kind,
            bet,
            won,
            profit,
            roll: Some(roll.value),
            server_seed_hash: Some(roll.server_seed_hash.clone()),
            nonce: Some(roll.nonce),
            created_at: Utc::now(),
        };
        self.db.insert_game(&record).await?;
        self.ledger
            .record_game_settled(kind, bet, won, profit)
            .await?;

        debug!(
            user_id,
            kind = kind.as_str(),
            bet,
            won,
            roll = roll.value,
            "game settled"
        );

        Ok(GameOutcome {
            game_id: record.id,
            kind,
            bet,
            won,
            profit,
            payout,
            roll: roll.value,
            server_seed_hash: roll.server_seed_hash,
            nonce: roll.nonce,
        })
    }
}

/// Payout rules per kind. Win probabilities and multipliers carry the
/// house edge; profits are derived with integer math off the stake.
fn resolve(kind: GameKind, roll: f64, bet: Amount) -> (bool, Amount) {
    match kind {
        // Under 0.495 doubles the stake.
        GameKind::Dice => {
            if roll < 0.495 {
                (true, bet)
            } else {
                (false, 0)
            }
        }
        GameKind::Coinflip => {
            if roll < 0.49 {
                (true, bet)
            } else {
                (false, 0)
            }
        }
        // Tiered reel table.
        GameKind::Slots => {
            let multiplier_tenths: Amount = if roll < 0.001 {
                500 // 50x
            } else if roll < 0.01 {
                100 // 10x
            } else if roll < 0.05 {
                50 // 5x
            } else if roll < 0.25 {
                20 // 2x
            } else {
                0
            };
            if multiplier_tenths > 0 {
                let payout = bet / 10 * multiplier_tenths;
                (true, payout - bet)
            } else {
                (false, 0)
            }
        }
        // Single safe-pick round at 2.4x.
        GameKind::Mines => {
            if roll < 0.40 {
                (true, bet / 10 * 14)
            } else {
                (false, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::operations::LedgerConfig;
    use crate::ledger::store::LedgerStore;

    async fn service() -> (tempfile::TempDir, CasinoDb, Arc<LedgerService>, GameService) {
        let dir = tempfile::tempdir().unwrap();
        let db = CasinoDb::new(dir.path().join("c.db").to_str().unwrap()).unwrap();
        let store = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        let ledger = LedgerService::open(store, LedgerConfig::default()).await.unwrap();
        // Fixed seed so outcomes are reproducible in tests.
        let fair = Arc::new(FairRoller::with_seed("test-seed"));
        let svc = GameService::new(db.clone(), ledger.clone(), fair, GameConfig::default());
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

    #[test]
    fn test_resolve_dice() {
        let bet = to_amount(10.0);
        assert_eq!(resolve(GameKind::Dice, 0.0, bet), (true, bet));
        assert_eq!(resolve(GameKind::Dice, 0.4949, bet), (true, bet));
        assert_eq!(resolve(GameKind::Dice, 0.495, bet), (false, 0));
        assert_eq!(resolve(GameKind::Dice, 0.99, bet), (false, 0));
    }

    #[test]
    fn test_resolve_slots_tiers() {
        let bet = to_amount(10.0);
        assert_eq!(resolve(GameKind::Slots, 0.0005, bet), (true, to_amount(490.0)));
        assert_eq!(resolve(GameKind::Slots, 0.005, bet), (true, to_amount(90.0)));
        assert_eq!(resolve(GameKind::Slots, 0.04, bet), (true, to_amount(40.0)));
        assert_eq!(resolve(GameKind::Slots, 0.2, bet), (true, to_amount(10.0)));
        assert_eq!(resolve(GameKind::Slots, 0.6, bet), (false, 0));
    }

    #[tokio::test]
    async fn test_play_settles_balance_and_ledger() {
        let (_d, db, ledger, svc) = service().await;
        fund(&db, &ledger, 1, 100.0).await;

        let outcome = svc
            .play(1, GameKind::Dice, to_amount(10.0), "client")
            .await
            .unwrap();

        let user = db.get_user(1).await.unwrap().unwrap();
        let expected = if outcome.won {
            to_amount(110.0)
        } else {
            to_amount(90.0)
        };
        assert_eq!(user.balance, expected);

        let s = ledger.snapshot().await;
        assert_eq!(s.total_bets, to_amount(10.0));
        assert_eq!(s.total_user_balance, expected);
        // Game settlement and user record agree exactly.
        assert_eq!(db.sum_user_liabilities().await.unwrap(), s.total_user_balance);
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected_before_roll() {
        let (_d, db, ledger, svc) = service().await;
        fund(&db, &ledger, 1, 5.0).await;

        let err = svc
            .play(1, GameKind::Dice, to_amount(10.0), "client")
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::InsufficientFunds));
        assert_eq!(
            db.get_user(1).await.unwrap().unwrap().balance,
            to_amount(5.0)
        );
        assert_eq!(ledger.snapshot().await.total_bets, 0);
    }

    #[tokio::test]
    async fn test_bet_bounds() {
        let (_d, db, ledger, svc) = service().await;
        fund(&db, &ledger, 1, 10_000.0).await;

        assert!(matches!(
            svc.play(1, GameKind::Dice, to_amount(0.01), "c").await.unwrap_err(),
            GameError::InvalidBet
        ));
        assert!(matches!(
            svc.play(1, GameKind::Dice, to_amount(5000.0), "c").await.unwrap_err(),
            GameError::InvalidBet
        ));
    }
}
