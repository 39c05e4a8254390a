use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub treasury: TreasuryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TreasuryConfig {
    /// Treasury account on chain
    pub address: String,
    /// JSON-RPC endpoint; without one every read degrades to cache/fallback
    pub rpc_url: Option<String>,
    /// Balance reported when no live read has ever succeeded
    pub fallback_balance: Decimal,
    /// Bound on a single provider fetch in milliseconds
    pub fetch_timeout_ms: u64,
}

impl TreasuryConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            address: "0x16B3d93d02FB58f7aCe79157E74Eb275D2c3F734".to_string(),
            rpc_url: None,
            fallback_balance: dec!(0.0012),
            fetch_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Control loop period in milliseconds
    pub tick_interval_ms: u64,
    /// Paid proposals wait while the treasury is at or below this balance
    pub min_reserve: Decimal,
    /// Consecutive unreachable ticks before a funded worker is stopped
    pub max_unreachable_ticks: u32,
    /// Hold paid proposals while the treasury reading is cached/simulated
    pub require_live_balance: bool,
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10_000,
            min_reserve: dec!(0.01),
            max_unreachable_ticks: 3,
            require_live_balance: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long a new worker has to answer its health check
    pub startup_timeout_ms: u64,
    /// Interval between health checks while starting
    pub health_poll_interval_ms: u64,
    /// Bound on a single health check
    pub probe_timeout_ms: u64,
    /// Time a worker gets to exit before it is force-killed
    pub stop_grace_ms: u64,
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 15_000,
            health_poll_interval_ms: 500,
            probe_timeout_ms: 3_000,
            stop_grace_ms: 5_000,
        }
    }
}

/// How worker processes are launched and reached
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Executable for every worker
    pub command: String,
    /// Arguments; `{agent_id}` and `{port}` are substituted
    pub args: Vec<String>,
    /// Working directory for workers
    pub working_dir: Option<PathBuf>,
    /// Host the worker's HTTP surface listens on
    pub host: String,
    /// First port handed out; each new worker gets the next one
    pub base_port: u16,
    pub health_path: String,
    pub log_path: String,
    pub kill_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec![
                "-m".to_string(),
                "uvicorn".to_string(),
                "agent:app".to_string(),
                "--app-dir".to_string(),
                "agents/{agent_id}".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            working_dir: None,
            host: "127.0.0.1".to_string(),
            base_port: 8080,
            health_path: "/probe".to_string(),
            log_path: "/log".to_string(),
            kill_path: "/kill".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// JSON snapshot file; in-memory only when unset
    pub snapshot_path: Option<PathBuf>,
    /// Start an empty ledger with the default proposals
    pub seed_defaults: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            seed_defaults: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DryRunConfig {
    /// Use the simulated chain and simulated workers
    pub enabled: bool,
    /// Starting balance of the simulated chain
    pub simulated_balance: Decimal,
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            simulated_balance: dec!(0.0012),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        Self::load_files(
            config_dir.join("default.toml"),
            Some(config_dir.join(
                std::env::var("MAYA_ENV").unwrap_or_else(|_| "development".to_string()),
            )),
        )
    }

    /// Load a single config file plus environment overrides
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_files(path.as_ref().to_path_buf(), None)
    }

    fn load_files(base: PathBuf, overlay: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(base).required(false));

        if let Some(overlay) = overlay {
            builder = builder.add_source(File::from(overlay).required(false));
        }

        // Override with environment variables (MAYA_TREASURY__RPC_URL, etc.)
        builder
            .add_source(
                Environment::with_prefix("MAYA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !is_hex_address(&self.treasury.address) {
            errors.push(format!(
                "treasury.address is not a 0x-prefixed 20-byte hex address: {}",
                self.treasury.address
            ));
        }

        if let Some(rpc_url) = &self.treasury.rpc_url {
            if url::Url::parse(rpc_url).is_err() {
                errors.push(format!("treasury.rpc_url is not a valid URL: {}", rpc_url));
            }
        }

        if self.treasury.fallback_balance < Decimal::ZERO {
            errors.push("treasury.fallback_balance must not be negative".to_string());
        }

        if self.treasury.fetch_timeout_ms == 0 {
            errors.push("treasury.fetch_timeout_ms must be positive".to_string());
        }

        if self.engine.tick_interval_ms == 0 {
            errors.push("engine.tick_interval_ms must be positive".to_string());
        }

        if self.engine.min_reserve < Decimal::ZERO {
            errors.push("engine.min_reserve must not be negative".to_string());
        }

        if self.engine.max_unreachable_ticks == 0 {
            errors.push("engine.max_unreachable_ticks must be at least 1".to_string());
        }

        if self.supervisor.health_poll_interval_ms == 0 {
            errors.push("supervisor.health_poll_interval_ms must be positive".to_string());
        }

        if self.supervisor.startup_timeout_ms < self.supervisor.health_poll_interval_ms {
            errors.push(
                "supervisor.startup_timeout_ms should be at least health_poll_interval_ms"
                    .to_string(),
            );
        }

        if self.supervisor.probe_timeout_ms == 0 {
            errors.push("supervisor.probe_timeout_ms must be positive".to_string());
        }

        if !self.dry_run.enabled {
            if self.runtime.command.trim().is_empty() {
                errors.push("runtime.command must not be empty".to_string());
            }
            if self.runtime.base_port == 0 {
                errors.push("runtime.base_port must not be 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn is_hex_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}
