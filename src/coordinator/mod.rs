//! Orchestration
//!
//! `OrchestrationEngine` drives the control loop over the ledger, the
//! balance oracle and the worker supervisor, and exposes status snapshots.

pub mod engine;
pub mod state;

pub use engine::OrchestrationEngine;
pub use state::{AgentReport, EngineSnapshot, ProposalCounts, StartFailure, TickReport};
