//! Runtime configuration.
//!
//! Everything comes from the environment (plus .env in development),
//! with production-safe defaults for the knobs and hard requirements for
//! the secrets.

use anyhow::{Context, Result};
use std::env;

use crate::casino::deposits::DepositConfig;
use crate::casino::duels::DuelConfig;
use crate::casino::events::EventBetConfig;
use crate::casino::games::GameConfig;
use crate::casino::treasury::TreasuryConfig;
use crate::casino::withdrawals::WithdrawalConfig;
use crate::ledger::amount::to_amount;
use crate::ledger::operations::LedgerConfig;
use crate::reconcile::report::ReconcileThresholds;
use crate::reconcile::ReconcileConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub casino_db_path: String,
    pub ledger_db_path: String,

    pub gateway_base_url: String,
    pub gateway_token: String,
    pub asset: String,

    /// Shared secret for the operator endpoints.
    pub admin_token: String,

    /// Alert channel; alerts are skipped when unset.
    pub alert_bot_token: Option<String>,
    pub alert_chat_id: Option<i64>,

    pub owner_recipient_id: i64,

    pub recalc_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Snapshots older than this are recalculated before use.
    pub max_state_age_secs: i64,

    pub ledger: LedgerConfig,
    pub thresholds: ReconcileThresholds,
    pub games: GameConfig,
    pub duels: DuelConfig,
    pub events: EventBetConfig,
    pub deposits: DepositConfig,
    pub withdrawals: WithdrawalConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let asset = env_str("CASINO_ASSET", "USDT");

        Ok(Self {
            listen_addr: env_str("LISTEN_ADDR", "0.0.0.0:8080"),
            casino_db_path: env_str("CASINO_DB_PATH", "data/casino.db"),
            ledger_db_path: env_str("LEDGER_DB_PATH", "data/ledger.db"),

            gateway_base_url: env_str("CRYPTOPAY_BASE_URL", "https://pay.crypt.bot"),
            gateway_token: env::var("CRYPTOPAY_TOKEN").context("CRYPTOPAY_TOKEN is required")?,
            asset: asset.clone(),

            admin_token: env::var("ADMIN_TOKEN").context("ADMIN_TOKEN is required")?,

            alert_bot_token: env::var("ALERT_BOT_TOKEN").ok(),
            alert_chat_id: env::var("ALERT_CHAT_ID").ok().and_then(|v| v.parse().ok()),

            owner_recipient_id: env_i64("OWNER_RECIPIENT_ID", 0),

            recalc_interval_secs: env_u64("RECALC_INTERVAL_SECS", 3600),
            reconcile_interval_secs: env_u64("RECONCILE_INTERVAL_SECS", 900),
            max_state_age_secs: env_i64("MAX_STATE_AGE_SECS", 3600),

            ledger: LedgerConfig {
                reserve_percentage: env_f64("RESERVE_PERCENTAGE", 30.0),
                min_owner_withdrawal: to_amount(env_f64("MIN_OWNER_WITHDRAWAL", 1.0)),
            },
            thresholds: ReconcileThresholds {
                minor: to_amount(env_f64("DISCREPANCY_MINOR", 1.0)),
                moderate: to_amount(env_f64("DISCREPANCY_MODERATE", 10.0)),
                critical: to_amount(env_f64("DISCREPANCY_CRITICAL", 100.0)),
            },
            games: GameConfig {
                min_bet: to_amount(env_f64("MIN_BET", 0.1)),
                max_bet: to_amount(env_f64("MAX_BET", 1000.0)),
            },
            duels: DuelConfig {
                min_stake: to_amount(env_f64("DUEL_MIN_STAKE", 0.5)),
                max_stake: to_amount(env_f64("DUEL_MAX_STAKE", 500.0)),
                commission_pct: env_f64("DUEL_COMMISSION_PCT", 5.0),
            },
            events: EventBetConfig {
                min_stake: to_amount(env_f64("EVENT_MIN_STAKE", 0.5)),
                max_stake: to_amount(env_f64("EVENT_MAX_STAKE", 2000.0)),
            },
            deposits: DepositConfig {
                asset: asset.clone(),
                min_amount: to_amount(env_f64("DEPOSIT_MIN", 1.0)),
                max_amount: to_amount(env_f64("DEPOSIT_MAX", 10_000.0)),
            },
            withdrawals: WithdrawalConfig {
                asset,
                min_amount: to_amount(env_f64("WITHDRAWAL_MIN", 1.0)),
                max_amount: to_amount(env_f64("WITHDRAWAL_MAX", 5000.0)),
                approval_threshold: to_amount(env_f64("WITHDRAWAL_APPROVAL_THRESHOLD", 100.0)),
                solvency_margin_pct: env_f64("WITHDRAWAL_SOLVENCY_MARGIN_PCT", 105.0),
            },
        })
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            asset: self.asset.clone(),
            thresholds: self.thresholds,
            max_state_age: chrono::Duration::seconds(self.max_state_age_secs),
        }
    }

    pub fn treasury_config(&self) -> TreasuryConfig {
        TreasuryConfig {
            asset: self.asset.clone(),
            owner_recipient_id: self.owner_recipient_id,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
