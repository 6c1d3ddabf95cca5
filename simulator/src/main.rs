//! Ledgerline Simulator
//!
//! Drives generated workloads through the transaction service on the
//! in-memory store and checks the ledger invariants afterwards.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod population;
mod scenario;

use controller::SimulationController;
use ledgerline_engine::EngineConfig;
use scenario::ScenarioKind;

/// Ledgerline Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "ledgerline-simulator")]
#[command(about = "Ledgerline load and invariant simulation")]
struct Args {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "mixed")]
    scenario: ScenarioKind,

    /// Number of simulated users
    #[arg(short, long, default_value = "8")]
    users: usize,

    /// Number of operations to generate
    #[arg(short, long, default_value = "1000")]
    operations: usize,

    /// Operations in flight at once
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Commits to fail with a serialization conflict before the run
    #[arg(long, default_value = "0")]
    inject_conflicts: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = EngineConfig::from_env()?;
    config.validate()?;

    info!(scenario = ?args.scenario, users = args.users, seed = ?args.seed, "Starting Ledgerline Simulator");

    let mut controller = SimulationController::new(config, args.seed)?;
    controller.initialize(args.users).await?;
    controller.inject_conflicts(args.inject_conflicts);

    controller
        .run_scenario(args.scenario, args.operations, args.concurrency)
        .await;
    controller.verify().await?;
    controller.shutdown().await;

    let summary = controller.metrics().summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        notifications = controller.notifications_delivered(),
        engine = ?controller.engine_metrics().snapshot(),
        "Simulation complete"
    );

    let violations = controller.violations();
    if !violations.is_empty() {
        for violation in violations {
            error!("{violation}");
        }
        anyhow::bail!("{} invariant violation(s)", violations.len());
    }
    Ok(())
}
