//! In-process worker backend for dry runs
//!
//! Workers are bookkeeping entries only. Per-agent switches control whether
//! a worker answers its health check and whether spawning fails.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use super::runtime::{ProcessRef, WorkerRuntime};
use crate::domain::WorkerActivity;
use crate::error::RuntimeError;

#[derive(Debug, Clone)]
struct AgentBehaviour {
    healthy: bool,
    fail_spawn: bool,
    spawns: u32,
}

impl Default for AgentBehaviour {
    fn default() -> Self {
        Self {
            healthy: true,
            fail_spawn: false,
            spawns: 0,
        }
    }
}

#[derive(Debug)]
struct SimulatedWorker {
    agent_id: String,
    started: Instant,
}

#[derive(Default)]
pub struct SimulatedRuntime {
    agents: DashMap<String, AgentBehaviour>,
    workers: DashMap<Uuid, SimulatedWorker>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether workers of this agent answer health checks
    pub fn set_healthy(&self, agent_id: &str, healthy: bool) {
        self.agents.entry(agent_id.to_string()).or_default().healthy = healthy;
    }

    /// Make the next spawns for this agent fail
    pub fn set_spawn_failure(&self, agent_id: &str, fail: bool) {
        self.agents.entry(agent_id.to_string()).or_default().fail_spawn = fail;
    }

    /// Successful spawns for this agent so far
    pub fn spawn_count(&self, agent_id: &str) -> u32 {
        self.agents.get(agent_id).map(|a| a.spawns).unwrap_or(0)
    }

    /// Workers of this agent that have not been terminated
    pub fn live_workers(&self, agent_id: &str) -> usize {
        self.workers
            .iter()
            .filter(|w| w.value().agent_id == agent_id)
            .count()
    }
}

#[async_trait]
impl WorkerRuntime for SimulatedRuntime {
    async fn spawn(&self, agent_id: &str) -> Result<ProcessRef, RuntimeError> {
        let mut agent = self.agents.entry(agent_id.to_string()).or_default();
        if agent.fail_spawn {
            return Err(RuntimeError::SpawnFailed(format!(
                "simulated spawn failure for {}",
                agent_id
            )));
        }
        agent.spawns += 1;
        drop(agent);

        let process = ProcessRef::new(agent_id);
        self.workers.insert(
            process.instance_id(),
            SimulatedWorker {
                agent_id: agent_id.to_string(),
                started: Instant::now(),
            },
        );
        debug!("Simulated worker {} spawned", process);
        Ok(process)
    }

    async fn health_check(
        &self,
        process: &ProcessRef,
        _timeout: Duration,
    ) -> Result<WorkerActivity, RuntimeError> {
        let runtime_hrs = self
            .workers
            .get(&process.instance_id())
            .map(|w| w.started.elapsed().as_secs_f64() / 3600.0)
            .ok_or_else(|| RuntimeError::Unreachable(format!("no worker {}", process)))?;

        let healthy = self
            .agents
            .get(process.agent_id())
            .map(|a| a.healthy)
            .unwrap_or(true);
        if !healthy {
            return Err(RuntimeError::Unreachable(format!(
                "simulated worker {} not answering",
                process
            )));
        }

        Ok(WorkerActivity {
            opportunity: Some(process.agent_id().to_string()),
            runtime_hrs: Some(runtime_hrs),
            roi_hrs: None,
        })
    }

    async fn terminate(&self, process: &ProcessRef, _grace: Duration) -> Result<(), RuntimeError> {
        if self.workers.remove(&process.instance_id()).is_some() {
            debug!("Simulated worker {} terminated", process);
        }
        Ok(())
    }

    async fn logs(
        &self,
        process: &ProcessRef,
        _timeout: Duration,
    ) -> Result<Vec<String>, RuntimeError> {
        let worker = self
            .workers
            .get(&process.instance_id())
            .ok_or_else(|| RuntimeError::Unreachable(format!("no worker {}", process)))?;
        Ok(vec![format!(
            "simulated worker for {} alive for {:?}",
            worker.agent_id,
            worker.started.elapsed()
        )])
    }
}
