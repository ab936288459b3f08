//! Ledger Module - Casino Financial Core
//!
//! This module owns the aggregate financial state of the deployment:
//! 1. Fixed-point money and the singleton `LedgerState`
//! 2. The update operations (the only sanctioned write path)
//! 3. Durable storage with a bounded audit trail
//! 4. The full recalculation engine that rebuilds state from the
//!    system of record
//!
//! Architecture:
//! - Settlement services call exactly one update operation per real-world
//!   financial event
//! - The reconciliation engine (reconcile/) reads snapshots, never writes
//! - Recalculation discards incremental drift on demand and on staleness

pub mod amount;
pub mod operations;
pub mod recalc;
pub mod state;
pub mod store;

#[cfg(test)]
mod ledger_tests;

pub use amount::{format_amount, from_amount, parse_amount, to_amount, Amount, AMOUNT_SCALE};
pub use operations::{LedgerConfig, LedgerOpError, LedgerService};
pub use recalc::RecalcEngine;
pub use state::{CommissionBreakdown, GameKind, GameTypeStats, LedgerState, LedgerWarnings};
pub use store::{HistoryEntry, LedgerStore, StoredReport};
