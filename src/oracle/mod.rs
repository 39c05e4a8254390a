//! Treasury balance reconciliation
//!
//! - `ChainDataProvider` seam with a JSON-RPC implementation
//! - `SimulatedChain` for dry runs
//! - `BalanceOracle` with cached/simulated fallback

pub mod balance_oracle;
pub mod provider;
pub mod simulated;

pub use balance_oracle::BalanceOracle;
pub use provider::{wei_hex_to_native, ChainDataProvider, JsonRpcProvider, OfflineProvider};
pub use simulated::SimulatedChain;
