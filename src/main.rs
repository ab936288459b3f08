//! Rollhouse - Telegram Casino Backend
//!
//! Wires the ledger core, settlement services and operator API together:
//! - SQLite system of record + ledger store
//! - Crypto Pay gateway client
//! - Periodic full recalculation and reconciliation schedulers
//! - axum HTTP server for the mini-app, bots and operators

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rollhouse_backend::{
    alerts::{NoopNotifier, Notifier, TelegramNotifier},
    api::{create_router, AppState},
    casino::{
        db::CasinoDb, deposits::DepositService, duels::DuelService, events::EventBetService,
        fair::FairRoller, games::GameService, promos::PromoService, treasury::TreasuryService,
        withdrawals::WithdrawalService,
    },
    gateway::cryptopay::CryptoPayClient,
    ledger::{operations::LedgerService, recalc::RecalcEngine, store::LedgerStore},
    models::Config,
    reconcile::ReconcileEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "rollhouse_backend=info,rollhouse=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(listen = %config.listen_addr, asset = %config.asset, "starting rollhouse backend");

    if let Some(parent) = std::path::Path::new(&config.casino_db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let casino_db = CasinoDb::new(&config.casino_db_path)?;
    let ledger_store = LedgerStore::new(&config.ledger_db_path)?;
    let ledger = LedgerService::open(ledger_store.clone(), config.ledger.clone()).await?;

    let gateway = Arc::new(CryptoPayClient::new(
        &config.gateway_base_url,
        &config.gateway_token,
    ));

    let notifier: Arc<dyn Notifier> = match (&config.alert_bot_token, config.alert_chat_id) {
        (Some(token), Some(chat_id)) => Arc::new(TelegramNotifier::new(token, chat_id)),
        _ => {
            info!("no alert channel configured, critical alerts go to the log only");
            Arc::new(NoopNotifier)
        }
    };

    let recalc = Arc::new(RecalcEngine::new(casino_db.clone(), ledger.clone()));
    let reconcile = Arc::new(ReconcileEngine::new(
        recalc.clone(),
        gateway.clone(),
        ledger_store,
        notifier,
        config.reconcile_config(),
    ));

    let fair = Arc::new(FairRoller::new());
    info!(commitment = %fair.commitment(), "provably-fair seed committed");

    let state = AppState {
        db: casino_db.clone(),
        ledger: ledger.clone(),
        recalc: recalc.clone(),
        reconcile: reconcile.clone(),
        games: Arc::new(GameService::new(
            casino_db.clone(),
            ledger.clone(),
            fair.clone(),
            config.games.clone(),
        )),
        duels: Arc::new(DuelService::new(
            casino_db.clone(),
            ledger.clone(),
            fair.clone(),
            config.duels.clone(),
        )),
        events: Arc::new(EventBetService::new(
            casino_db.clone(),
            ledger.clone(),
            config.events.clone(),
        )),
        deposits: Arc::new(DepositService::new(
            casino_db.clone(),
            ledger.clone(),
            gateway.clone(),
            config.deposits.clone(),
        )),
        withdrawals: Arc::new(WithdrawalService::new(
            casino_db.clone(),
            ledger.clone(),
            gateway.clone(),
            config.withdrawals.clone(),
        )),
        promos: Arc::new(PromoService::new(casino_db.clone(), ledger.clone())),
        treasury: Arc::new(TreasuryService::new(
            casino_db,
            ledger,
            gateway,
            config.treasury_config(),
        )),
        fair,
        admin_token: Arc::new(config.admin_token.clone()),
        max_state_age: chrono::Duration::seconds(config.max_state_age_secs),
    };

    spawn_recalc_scheduler(recalc, config.recalc_interval_secs);
    spawn_reconcile_scheduler(reconcile, config.reconcile_interval_secs);

    let app = create_router(state).layer(CorsLayer::permissive());
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic drift correction. Failures are logged, never fatal: the next
/// tick retries.
fn spawn_recalc_scheduler(recalc: Arc<RecalcEngine>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(60)));
        ticker.tick().await; // immediate first tick consumed
        loop {
            ticker.tick().await;
            match recalc.run().await {
                Ok(state) => info!(
                    operational = state.operational_balance,
                    users = state.total_user_balance,
                    "scheduled recalculation done"
                ),
                Err(e) => error!(error = %e, "scheduled recalculation failed"),
            }
        }
    });
}

fn spawn_reconcile_scheduler(reconcile: Arc<ReconcileEngine>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(60)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match reconcile.run().await {
                Ok(report) => info!(
                    severity = report.severity.as_str(),
                    discrepancy = report.discrepancy,
                    "scheduled reconciliation done"
                ),
                Err(e) => error!(error = %e, "scheduled reconciliation failed"),
            }
        }
    });
}
