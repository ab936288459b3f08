//! Balance reconciliation against the external gateway.

pub mod engine;
pub mod report;

pub use engine::{expected_balance, ReconcileConfig, ReconcileEngine};
pub use report::{
    ExpectedBalance, ReconcileThresholds, ReconciliationReport, ReportStatus, Severity,
};
