//! Casino Module - System of Record & Settlement Workflows
//!
//! This module handles:
//! 1. The authoritative user/deposit/withdrawal/game/duel/promo records
//! 2. Provably-fair roll generation
//! 3. Settlement orchestration: every workflow debits atomically, calls
//!    the gateway where needed, runs exactly one ledger operation per
//!    settled event, and compensates on failure

pub mod db;
pub mod deposits;
pub mod duels;
pub mod events;
pub mod fair;
pub mod games;
pub mod promos;
pub mod treasury;
pub mod withdrawals;

pub use db::{
    CasinoDb, DepositRecord, DepositStatus, DuelRecord, DuelStatus, EventBetRecord,
    EventBetStatus, GameRecord, PromoCode, UserRecord, WithdrawalRecord, WithdrawalStatus,
};
pub use deposits::{DepositConfig, DepositError, DepositService, PendingDeposit};
pub use duels::{DuelConfig, DuelError, DuelResult, DuelService};
pub use events::{EventBetConfig, EventBetError, EventBetService};
pub use fair::{derive_roll, verify_commitment, FairRoller, RevealedSeed, Roll};
pub use games::{GameConfig, GameError, GameOutcome, GameService};
pub use promos::{PromoError, PromoService};
pub use treasury::{TreasuryConfig, TreasuryError, TreasuryService};
pub use withdrawals::{WithdrawalConfig, WithdrawalError, WithdrawalReceipt, WithdrawalService};
