//! Dispatch Worker - Entry Point
//!
//! Consumes document status events and runs the reconciliation schedules.
//! Single reconciliation jobs can be run once from the command line.

use clap::{Parser, Subcommand};
use core_config::Environment;
use core_config::tracing::{init_tracing, install_color_eyre};
use dispatch_worker::{DispatchWorker, shutdown_channel};
use domain_dispatch::ReconciliationJob;
use eyre::Result;
use tracing::info;

#[derive(Parser)]
#[command(name = "dispatch-worker")]
#[command(about = "Keep dispatches in step with production, archive and distribution")]
struct Cli {
    /// Apply pending database migrations before starting
    #[arg(long, global = true)]
    migrate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume document status events
    Consume,

    /// Run the reconciliation jobs on their cron schedules
    Schedule,

    /// Consume events and run the schedules (default)
    Run,

    /// Run one reconciliation job and print its report
    Reconcile {
        /// retry-orders, promote-documents or distribution
        #[arg(short, long)]
        job: ReconciliationJob,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    info!(environment = ?environment, "Starting dispatch worker");

    let worker = DispatchWorker::connect(cli.migrate).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Consume => worker.consume(shutdown_channel()).await?,
        Commands::Schedule => worker.schedule(shutdown_channel()).await?,
        Commands::Run => worker.run(shutdown_channel()).await?,
        Commands::Reconcile { job } => {
            let report = worker.reconcile(job).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    info!("Dispatch worker stopped");
    Ok(())
}
