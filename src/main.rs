use clap::Parser;
use maya::cli::{Cli, Commands};
use maya::config::AppConfig;
use maya::coordination::{install_signal_handlers, GracefulShutdown};
use maya::coordinator::OrchestrationEngine;
use maya::error::{MayaError, Result};
use std::sync::Arc;
use tracing::{error, info};

mod main_runtime;

use main_runtime::{build_engine, config_error, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_file(path)?,
        None => AppConfig::load()?,
    };
    if cli.dry_run {
        config.dry_run.enabled = true;
    }

    init_logging(&config.logging);
    config.validate().map_err(config_error)?;

    let engine = Arc::new(build_engine(&config).await?);

    match &cli.command {
        Commands::Run => run(engine).await,
        Commands::Tick => {
            let report = engine.tick().await;
            print_json(&report)?;
            // Workers do not outlive a one-shot tick
            engine.stop_workers().await;
            print_json(&engine.snapshot().await)
        }
        Commands::Treasury => print_json(&engine.treasury().await),
        Commands::Proposals { pending } => {
            let proposals = if *pending {
                engine.list_pending().await
            } else {
                engine.proposals().await
            };
            print_json(&proposals)
        }
        cmd @ Commands::Submit { .. } => {
            let proposal = cmd
                .proposal()
                .ok_or_else(|| MayaError::Internal("submit without proposal".to_string()))?;
            ledger_result(engine.submit(proposal).await)
        }
        Commands::Approve { id } => ledger_result(engine.approve(id).await),
        Commands::Reject { id } => ledger_result(engine.reject(id).await),
    }
}

async fn run(engine: Arc<OrchestrationEngine>) -> Result<()> {
    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone());

    info!("maya running; Ctrl+C to stop");
    engine.run(shutdown.token()).await;
    Ok(())
}

fn ledger_result<T: serde::Serialize>(
    result: std::result::Result<T, maya::error::LedgerError>,
) -> Result<()> {
    match result {
        Ok(value) => print_json(&value),
        Err(e) => {
            error!("{} ({})", e, e.code());
            let body = serde_json::json!({
                "error": e.code(),
                "status": e.http_status(),
                "message": e.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Err(e.into())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
