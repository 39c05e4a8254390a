use maya::config::{AppConfig, LoggingConfig};
use maya::coordinator::OrchestrationEngine;
use maya::error::{MayaError, Result};
use maya::ledger::{seeded_ledger, LedgerStore, ProposalLedger};
use maya::oracle::{BalanceOracle, ChainDataProvider, JsonRpcProvider, OfflineProvider, SimulatedChain};
use maya::supervisor::{ProcessRuntime, SimulatedRuntime, WorkerRuntime, WorkerSupervisor};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},maya=debug", logging.level)));

    // File logging only when MAYA_LOG_DIR is set and writable;
    // `rolling::daily` panics if it cannot create its first file.
    let log_dir = std::env::var("MAYA_LOG_DIR").ok();
    let file_layer = log_dir.as_deref().and_then(|dir| {
        let probe = std::path::Path::new(dir).join(".maya_write_test");
        let writable = std::fs::create_dir_all(dir).is_ok()
            && std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&probe)
                .is_ok();
        if !writable {
            eprintln!(
                "Warning: Could not write to log directory {}, file logging disabled",
                dir
            );
            return None;
        }
        let _ = std::fs::remove_file(&probe);

        let file_appender = tracing_appender::rolling::daily(dir, "maya.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the guard for the life of the process
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (json_layer, text_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    let file_logging_enabled = file_layer.is_some();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/maya.log", dir);
    }
}

/// Engine wired to either the live chain and local processes or their
/// simulated counterparts
pub async fn build_engine(config: &AppConfig) -> Result<OrchestrationEngine> {
    let (provider, runtime): (Arc<dyn ChainDataProvider>, Arc<dyn WorkerRuntime>) =
        if config.dry_run.enabled {
            info!(
                "Dry run: simulated chain at {} and simulated workers",
                config.dry_run.simulated_balance
            );
            (
                Arc::new(SimulatedChain::new(config.dry_run.simulated_balance)),
                Arc::new(SimulatedRuntime::new()),
            )
        } else {
            let provider: Arc<dyn ChainDataProvider> = match &config.treasury.rpc_url {
                Some(url) => Arc::new(JsonRpcProvider::new(url)?),
                None => {
                    warn!("No treasury.rpc_url configured; balances will come from the fallback");
                    Arc::new(OfflineProvider)
                }
            };
            (provider, Arc::new(ProcessRuntime::new(config.runtime.clone())?))
        };

    let oracle = Arc::new(BalanceOracle::new(provider, config.treasury.clone()));
    let supervisor = Arc::new(WorkerSupervisor::new(runtime, config.supervisor.clone()));

    let store = config.ledger.snapshot_path.clone().map(LedgerStore::new);
    let ledger = load_ledger(config, store.as_ref()).await?;

    let engine = OrchestrationEngine::new(config.engine.clone(), ledger, oracle, supervisor);
    Ok(match store {
        Some(store) => engine.with_store(store),
        None => engine,
    })
}

async fn load_ledger(config: &AppConfig, store: Option<&LedgerStore>) -> Result<ProposalLedger> {
    if let Some(store) = store {
        if let Some(ledger) = store.load().await? {
            return Ok(ledger);
        }
    }

    if config.ledger.seed_defaults {
        Ok(seeded_ledger())
    } else {
        Ok(ProposalLedger::new())
    }
}

pub fn config_error(errors: Vec<String>) -> MayaError {
    MayaError::Validation(errors.join("; "))
}
