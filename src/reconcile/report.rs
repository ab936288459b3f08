//! Reconciliation report model.
//!
//! A report is created by each reconciliation run and never mutated
//! afterwards. Severity distinguishes drift (numeric discrepancy with
//! plausible operational causes, classified by configurable thresholds)
//! from logic violations (states that are impossible in a correct system,
//! always critical).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::GatewayBalance;
use crate::ledger::amount::{Amount, AMOUNT_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Minor,
    Moderate,
    Critical,
    /// The gateway could not be reached; nothing was compared. Explicitly
    /// NOT "balances match".
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Minor => "minor",
            Severity::Moderate => "moderate",
            Severity::Critical => "critical",
            Severity::Error => "error",
        }
    }
}

/// Drift classification boundaries, in minor units. Configuration, not
/// business logic: deployments tune these per asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconcileThresholds {
    /// At or below: `ok`.
    pub minor: Amount,
    /// At or below: `minor`.
    pub moderate: Amount,
    /// At or below: `moderate`; above: `critical`.
    pub critical: Amount,
}

impl Default for ReconcileThresholds {
    fn default() -> Self {
        Self {
            minor: AMOUNT_SCALE,            // 1 coin
            moderate: 10 * AMOUNT_SCALE,    // 10 coins
            critical: 100 * AMOUNT_SCALE,   // 100 coins
        }
    }
}

impl ReconcileThresholds {
    pub fn classify(&self, discrepancy_abs: Amount) -> Severity {
        if discrepancy_abs <= self.minor {
            Severity::Ok
        } else if discrepancy_abs <= self.moderate {
            Severity::Minor
        } else if discrepancy_abs <= self.critical {
            Severity::Moderate
        } else {
            Severity::Critical
        }
    }
}

/// The ledger-side derivation of what the gateway should hold, with the
/// breakdown used to compute it.
///
/// Two independent formulas on purpose: `expected` from the cash-flow
/// totals, `custody_view` from obligations. They should agree; their
/// disagreement is its own finding, reported separately from gateway
/// drift.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExpectedBalance {
    /// `total_deposits - total_withdrawals - total_owner_withdrawals`.
    pub expected: Amount,
    pub total_deposits: Amount,
    pub total_withdrawals: Amount,
    pub total_owner_withdrawals: Amount,
    /// `operational_balance + total_user_balance`.
    pub custody_view: Amount,
    /// `expected - custody_view`.
    pub derivation_delta: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Ok,
    Error,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Ok => "ok",
            ReportStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    pub status: ReportStatus,
    pub gateway_balance: Option<GatewayBalance>,
    pub expected: ExpectedBalance,
    /// `gateway.total - expected`. Positive: gateway holds more than the
    /// ledger accounts for.
    pub discrepancy: Amount,
    pub discrepancy_abs: Amount,
    pub severity: Severity,
    pub analysis: Vec<String>,
    /// Impossible-state findings; any entry forces `critical`.
    pub logic_violations: Vec<String>,
    pub recommendations: Vec<String>,
    pub error: Option<String>,
}
