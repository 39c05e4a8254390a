pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod oracle;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal, ShutdownToken};
pub use coordinator::{EngineSnapshot, OrchestrationEngine, TickReport};
pub use domain::{
    BalanceSource, Proposal, ProposalStatus, TreasuryState, WorkerHandle, WorkerState,
};
pub use error::{LedgerError, MayaError, Result, SupervisorError};
pub use ledger::{LedgerStore, ProposalLedger};
pub use oracle::{BalanceOracle, ChainDataProvider};
pub use supervisor::{WorkerRuntime, WorkerSupervisor};
