//! Worker runtime seam
//!
//! The supervisor only ever talks to workers through `WorkerRuntime`, so the
//! process backend (local processes, containers, simulation) can change
//! without touching supervision or orchestration logic.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::WorkerActivity;
use crate::error::RuntimeError;

/// Opaque reference to one launched worker process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessRef {
    instance_id: Uuid,
    agent_id: String,
}

impl ProcessRef {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.agent_id, self.instance_id)
    }
}

/// Start, check and stop worker processes
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Launch a worker for `agent_id`
    async fn spawn(&self, agent_id: &str) -> Result<ProcessRef, RuntimeError>;

    /// Query the worker's health surface
    async fn health_check(
        &self,
        process: &ProcessRef,
        timeout: Duration,
    ) -> Result<WorkerActivity, RuntimeError>;

    /// Ask the worker to exit, force-kill after `grace`. Terminating an
    /// unknown or already exited process succeeds.
    async fn terminate(&self, process: &ProcessRef, grace: Duration) -> Result<(), RuntimeError>;

    /// Recent log lines reported by the worker
    async fn logs(
        &self,
        _process: &ProcessRef,
        _timeout: Duration,
    ) -> Result<Vec<String>, RuntimeError> {
        Ok(Vec::new())
    }
}
