//! Worker supervision
//!
//! - `WorkerRuntime` seam over how workers are launched
//! - `ProcessRuntime` for local child processes with an HTTP surface
//! - `SimulatedRuntime` for dry runs
//! - `WorkerSupervisor` owning the per-agent worker state machine

pub mod process;
pub mod runtime;
pub mod simulated;
pub mod worker_supervisor;

pub use process::{parse_activity, ProcessRuntime};
pub use runtime::{ProcessRef, WorkerRuntime};
pub use simulated::SimulatedRuntime;
pub use worker_supervisor::WorkerSupervisor;
