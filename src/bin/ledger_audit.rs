//! One-shot financial audit tool.
//!
//! Runs a full recalculation against the system of record, then a
//! reconciliation against the gateway, and prints the resulting report.
//! Intended for operators and cron; the long-running server does the
//! same work on its schedulers.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use rollhouse_backend::{
    alerts::NoopNotifier,
    casino::db::CasinoDb,
    gateway::cryptopay::CryptoPayClient,
    ledger::{
        amount::format_amount, operations::LedgerService, recalc::RecalcEngine, store::LedgerStore,
    },
    models::Config,
    reconcile::ReconcileEngine,
};

#[derive(Parser)]
#[command(name = "ledger_audit", about = "Recalculate the ledger and reconcile it against the gateway")]
struct Args {
    /// Skip the gateway comparison; only recalculate and print the state.
    #[arg(long)]
    recalc_only: bool,

    /// Emit the full report as JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let casino_db = CasinoDb::new(&config.casino_db_path)?;
    let ledger_store = LedgerStore::new(&config.ledger_db_path)?;
    let ledger = LedgerService::open(ledger_store.clone(), config.ledger.clone()).await?;
    let recalc = Arc::new(RecalcEngine::new(casino_db, ledger));

    let state = recalc.run().await?;
    if args.recalc_only {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&state)?);
        } else {
            print_state(&state);
        }
        return Ok(());
    }

    let gateway = Arc::new(CryptoPayClient::new(
        &config.gateway_base_url,
        &config.gateway_token,
    ));
    let reconcile = ReconcileEngine::new(
        recalc,
        gateway,
        ledger_store,
        Arc::new(NoopNotifier),
        config.reconcile_config(),
    );

    let report = reconcile.run().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_state(&state);
    println!();
    println!("=== RECONCILIATION ===");
    println!("severity:     {}", report.severity.as_str());
    match report.gateway_balance {
        Some(balance) => println!("gateway:      {}", format_amount(balance.total)),
        None => println!("gateway:      unavailable"),
    }
    println!("expected:     {}", format_amount(report.expected.expected));
    println!("custody view: {}", format_amount(report.expected.custody_view));
    println!("discrepancy:  {}", format_amount(report.discrepancy));
    for line in &report.analysis {
        println!("  - {}", line);
    }
    for violation in &report.logic_violations {
        println!("  ! {}", violation);
    }
    for rec in &report.recommendations {
        println!("  > {}", rec);
    }

    Ok(())
}

fn print_state(state: &rollhouse_backend::ledger::state::LedgerState) {
    println!("=== LEDGER STATE ===");
    println!("user balance:   {}", format_amount(state.total_user_balance));
    println!("operational:    {}", format_amount(state.operational_balance));
    println!("reserve:        {}", format_amount(state.reserve_balance));
    println!("available:      {}", format_amount(state.available_for_withdrawal));
    println!("deposits:       {}", format_amount(state.total_deposits));
    println!("withdrawals:    {}", format_amount(state.total_withdrawals));
    println!("bets / wins:    {} / {}", format_amount(state.total_bets), format_amount(state.total_wins));
    println!("commissions:    {}", format_amount(state.total_commissions));
    println!("promo expense:  {}", format_amount(state.total_promocode_expenses));
    println!("gateway fees:   {}", format_amount(state.total_gateway_fees));
    println!("owner taken:    {}", format_amount(state.total_owner_withdrawals));
    if state.warnings.negative_operational
        || state.warnings.low_reserve
        || state.warnings.high_risk_ratio
    {
        println!("warnings:       {:?}", state.warnings);
    }
}
