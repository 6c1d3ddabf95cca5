//! Ledgerline operator binary.
//!
//! Runs migrations, bootstraps the house accounts and checks that every
//! cached balance still matches its ledger entries.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgerline_engine::{AccountProvisioner, EngineConfig};
use ledgerline_ledger::{
    postgres, LedgerStore, PgLedgerStore, RandomJitter, ReconciliationReport, TxExecutor,
};

#[derive(Parser, Debug)]
#[command(name = "ledgerline", about = "Ledgerline ledger operations")]
struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Create the USD and EUR system accounts if missing
    Bootstrap,
    /// Compare every cached balance with the sum of its ledger entries
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = EngineConfig::from_env().context("loading configuration")?;
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let pool = postgres::connect(&config.database.pool_settings())
        .await
        .context("connecting to the database")?;
    let store = Arc::new(PgLedgerStore::new(pool));

    match args.command {
        Command::Migrate => {
            store.migrate().await.context("running migrations")?;
            info!("Migrations applied");
        }
        Command::Bootstrap => {
            let executor = Arc::new(
                TxExecutor::new(store.clone())
                    .with_policy(config.executor.retry_policy())
                    .with_jitter(Arc::new(RandomJitter))
                    .with_deadline(config.executor.request_timeout),
            );
            let provisioner =
                AccountProvisioner::new(store.clone(), executor, store.clone(), config.bootstrap.clone());
            for account in provisioner.bootstrap().await.context("bootstrapping system accounts")? {
                info!(
                    account_id = %account.id,
                    currency = %account.currency,
                    balance = %account.formatted_balance(),
                    "System account ready"
                );
            }
        }
        Command::Reconcile => {
            let report = ReconciliationReport::from_rows(store.reconcile().await?);
            if !report.is_clean() {
                for line in report.describe_drift() {
                    error!(drift = %line, "Balance drift");
                }
                anyhow::bail!(
                    "{} of {} accounts drifted from their ledger entries",
                    report.drifted.len(),
                    report.accounts_checked
                );
            }
            info!(accounts = report.accounts_checked, "Ledger reconciled");
        }
    }

    Ok(())
}
