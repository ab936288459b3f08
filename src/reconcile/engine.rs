//! Reconciliation engine.
//!
//! The system's primary defense against silent financial bugs: compare
//! the ledger's belief about custody with what the gateway actually
//! holds, classify the gap, and say what to do about it.
//!
//! Read-only with respect to the ledger: drift is never corrected from
//! here. Correction happens only through an explicit, audited full
//! recalculation.

use anyhow::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::alerts::{dispatch, Notifier};
use crate::gateway::PaymentGateway;
use crate::ledger::amount::format_amount;
use crate::ledger::recalc::RecalcEngine;
use crate::ledger::state::LedgerState;
use crate::ledger::store::{LedgerStore, StoredReport};
use crate::reconcile::report::{
    ExpectedBalance, ReconcileThresholds, ReconciliationReport, ReportStatus, Severity,
};

pub struct ReconcileConfig {
    pub asset: String,
    pub thresholds: ReconcileThresholds,
    /// Snapshot older than this triggers a recalculation before
    /// comparison.
    pub max_state_age: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            asset: "USDT".to_string(),
            thresholds: ReconcileThresholds::default(),
            max_state_age: Duration::hours(1),
        }
    }
}

pub struct ReconcileEngine {
    recalc: Arc<RecalcEngine>,
    gateway: Arc<dyn PaymentGateway>,
    store: LedgerStore,
    notifier: Arc<dyn Notifier>,
    config: ReconcileConfig,
}

impl ReconcileEngine {
    pub fn new(
        recalc: Arc<RecalcEngine>,
        gateway: Arc<dyn PaymentGateway>,
        store: LedgerStore,
        notifier: Arc<dyn Notifier>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            recalc,
            gateway,
            store,
            notifier,
            config,
        }
    }

    /// One reconciliation pass. Gateway failure produces an error-status
    /// report, not an Err; Err is reserved for storage failures.
    pub async fn run(&self) -> Result<ReconciliationReport> {
        // The ledger refresh and the gateway call are independent; overlap
        // them.
        let (state, gateway_balance) = tokio::join!(
            self.recalc.ensure_fresh(self.config.max_state_age),
            self.gateway.get_balance(&self.config.asset)
        );
        let state = state?;
        let expected = expected_balance(&state);

        let gateway_balance = match gateway_balance {
            Ok(balance) => balance,
            Err(e) => {
                warn!(error = %e, "reconciliation could not read gateway balance");
                let report = ReconciliationReport {
                    timestamp: Utc::now(),
                    status: ReportStatus::Error,
                    gateway_balance: None,
                    expected,
                    discrepancy: 0,
                    discrepancy_abs: 0,
                    severity: Severity::Error,
                    analysis: vec![
                        "Gateway balance unavailable; no comparison was made.".to_string(),
                    ],
                    logic_violations: Vec::new(),
                    recommendations: vec![
                        "Check gateway connectivity and token validity.".to_string(),
                        "Re-run reconciliation once the gateway responds.".to_string(),
                    ],
                    error: Some(e.to_string()),
                };
                self.persist(&report).await?;
                return Ok(report);
            }
        };

        let discrepancy = gateway_balance.total - expected.expected;
        let discrepancy_abs = discrepancy.abs();
        let mut severity = self.config.thresholds.classify(discrepancy_abs);

        let mut analysis = Vec::new();
        if discrepancy_abs > self.config.thresholds.minor {
            if discrepancy > 0 {
                analysis.push(format!(
                    "Gateway holds {} MORE than the ledger accounts for.",
                    format_amount(discrepancy_abs)
                ));
                analysis.push("Possible causes: deposits confirmed at the gateway but not \
                     recorded, overestimated gateway fees, withdrawals marked \
                     completed that never left."
                    .to_string());
            } else {
                analysis.push(format!(
                    "Gateway holds {} LESS than the ledger accounts for.",
                    format_amount(discrepancy_abs)
                ));
                analysis.push("Possible causes: unrecorded gateway fees, withdrawals paid \
                     out but stuck before `completed`, deposits recorded that \
                     never settled, phantom user balances."
                    .to_string());
            }
        }

        // The two internal derivations must agree with each other too.
        if expected.derivation_delta.abs() > self.config.thresholds.minor {
            analysis.push(format!(
                "Internal derivations disagree: cash-flow expected {} vs custody view {} \
                 (delta {}). One of the two formulas is tracking an unrecorded flow.",
                format_amount(expected.expected),
                format_amount(expected.custody_view),
                format_amount(expected.derivation_delta),
            ));
            if severity == Severity::Ok {
                severity = Severity::Minor;
            }
        }

        // Logic-consistency checks are independent of the numeric
        // thresholds: these states are impossible in a correct system.
        let mut logic_violations = Vec::new();
        if state.total_user_balance > gateway_balance.total {
            logic_violations.push(format!(
                "User liabilities {} exceed custodial assets {}. Obligations cannot be \
                 covered.",
                format_amount(state.total_user_balance),
                format_amount(gateway_balance.total),
            ));
        }
        if state.total_user_balance < 0 {
            logic_violations.push(format!(
                "Aggregate user balance is negative: {}.",
                format_amount(state.total_user_balance)
            ));
        }
        if !logic_violations.is_empty() {
            severity = Severity::Critical;
        }

        let recommendations = recommendations_for(severity);

        let report = ReconciliationReport {
            timestamp: Utc::now(),
            status: ReportStatus::Ok,
            gateway_balance: Some(gateway_balance),
            expected,
            discrepancy,
            discrepancy_abs,
            severity,
            analysis,
            logic_violations,
            recommendations,
            error: None,
        };

        self.persist(&report).await?;

        match severity {
            Severity::Ok => info!(
                discrepancy = %format_amount(discrepancy),
                "reconciliation clean"
            ),
            Severity::Critical => {
                error!(
                    discrepancy = %format_amount(discrepancy),
                    violations = report.logic_violations.len(),
                    "CRITICAL reconciliation result"
                );
                dispatch(self.notifier.clone(), critical_alert_text(&report));
            }
            _ => warn!(
                discrepancy = %format_amount(discrepancy),
                severity = severity.as_str(),
                "reconciliation found drift"
            ),
        }

        Ok(report)
    }

    pub async fn history(&self, limit: usize, offset: usize) -> Result<Vec<StoredReport>> {
        self.store.list_reports(limit, offset).await
    }

    async fn persist(&self, report: &ReconciliationReport) -> Result<()> {
        self.store
            .insert_report(
                report.severity.as_str(),
                report.status.as_str(),
                &serde_json::to_value(report)?,
            )
            .await
    }
}

/// Both derivations of expected custody, from one snapshot.
pub fn expected_balance(state: &LedgerState) -> ExpectedBalance {
    let expected =
        state.total_deposits - state.total_withdrawals - state.total_owner_withdrawals;
    let custody_view = state.custody_view();
    ExpectedBalance {
        expected,
        total_deposits: state.total_deposits,
        total_withdrawals: state.total_withdrawals,
        total_owner_withdrawals: state.total_owner_withdrawals,
        custody_view,
        derivation_delta: expected - custody_view,
    }
}

fn recommendations_for(severity: Severity) -> Vec<String> {
    match severity {
        Severity::Ok => vec!["No action needed; routine monitoring.".to_string()],
        Severity::Minor => vec![
            "Log and monitor; expected to clear once in-flight operations settle.".to_string(),
        ],
        Severity::Moderate => vec![
            "Investigate transactions since the last clean reconciliation.".to_string(),
            "Run a full recalculation and re-reconcile.".to_string(),
        ],
        Severity::Critical => vec![
            "HALT withdrawals until the discrepancy is explained.".to_string(),
            "Escalate to the operators immediately.".to_string(),
            "Audit recent deposits, withdrawals and owner withdrawals.".to_string(),
        ],
        Severity::Error => vec![
            "Check gateway connectivity and token validity.".to_string(),
        ],
    }
}

fn critical_alert_text(report: &ReconciliationReport) -> String {
    let mut text = format!(
        "🚨 CRITICAL reconciliation alert\nDiscrepancy: {}\nExpected: {}\nGateway: {}",
        format_amount(report.discrepancy),
        format_amount(report.expected.expected),
        report
            .gateway_balance
            .map(|b| format_amount(b.total))
            .unwrap_or_else(|| "unavailable".to_string()),
    );
    for violation in &report.logic_violations {
        text.push_str("\n• ");
        text.push_str(violation);
    }
    text
}
