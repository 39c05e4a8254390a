//! Worker Supervisor
//!
//! Starts, health-checks and stops one long-running worker per agent.
//!
//! State machine per agent:
//! `Stopped -> Starting -> Running <-> Unreachable -> Stopping -> Stopped`
//!
//! The handle map lock is never held across runtime calls. Every result that
//! comes back from the runtime is applied only if the slot still belongs to
//! the same worker incarnation, so a stop racing a start or probe wins.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::runtime::{ProcessRef, WorkerRuntime};
use crate::config::SupervisorConfig;
use crate::domain::{WorkerActivity, WorkerHandle, WorkerState};
use crate::error::{RuntimeError, SupervisorError};

/// Extra time given to a runtime's own force-kill after the grace period
const KILL_MARGIN: Duration = Duration::from_secs(2);

/// Bound on a log tail request
const LOG_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct WorkerSlot {
    handle: WorkerHandle,
    process: Option<ProcessRef>,
}

impl WorkerSlot {
    fn owned_by(&self, instance_id: Uuid) -> bool {
        self.handle.instance_id == Some(instance_id)
    }
}

pub struct WorkerSupervisor {
    runtime: Arc<dyn WorkerRuntime>,
    config: SupervisorConfig,
    slots: Mutex<HashMap<String, WorkerSlot>>,
}

impl WorkerSupervisor {
    pub fn new(runtime: Arc<dyn WorkerRuntime>, config: SupervisorConfig) -> Self {
        Self {
            runtime,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Launch a worker for `agent_id` and wait for its first healthy answer.
    ///
    /// Returns the handle in `Running`, or in `Unreachable` when the worker
    /// did not answer within the startup timeout.
    pub async fn start(&self, agent_id: &str) -> Result<WorkerHandle, SupervisorError> {
        let (stale, instance_id) = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .entry(agent_id.to_string())
                .or_insert_with(|| WorkerSlot {
                    handle: WorkerHandle::stopped(agent_id),
                    process: None,
                });

            if slot.handle.state.is_live() || slot.handle.state == WorkerState::Stopping {
                return Err(SupervisorError::AlreadyRunning {
                    agent_id: agent_id.to_string(),
                });
            }

            let instance_id = Uuid::new_v4();
            let stale = slot.process.take();
            slot.handle = WorkerHandle {
                state: WorkerState::Starting,
                instance_id: Some(instance_id),
                started_at: Some(Utc::now()),
                ..WorkerHandle::stopped(agent_id)
            };
            (stale, instance_id)
        };

        if let Some(stale) = stale {
            info!("Cleaning up stale worker {} before restart", stale);
            if let Err(e) = self.terminate_bounded(&stale).await {
                warn!("Cleanup of stale worker {} failed: {}", stale, e);
            }
        }

        info!("Starting worker for agent {}", agent_id);
        let process = match self.runtime.spawn(agent_id).await {
            Ok(process) => process,
            Err(e) => {
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots.get_mut(agent_id) {
                    if slot.owned_by(instance_id) {
                        slot.handle.state = WorkerState::Stopped;
                        slot.handle.last_error = Some(e.to_string());
                    }
                }
                error!("Failed to spawn worker for agent {}: {}", agent_id, e);
                return Err(SupervisorError::ProcessSpawnFailure {
                    agent_id: agent_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if !self.attach(agent_id, instance_id, &process).await {
            return self.abandon_start(agent_id, &process).await;
        }

        self.await_healthy(agent_id, instance_id, process).await
    }

    async fn attach(&self, agent_id: &str, instance_id: Uuid, process: &ProcessRef) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(agent_id) {
            Some(slot) if slot.owned_by(instance_id) && slot.handle.state == WorkerState::Starting => {
                slot.process = Some(process.clone());
                true
            }
            _ => false,
        }
    }

    async fn abandon_start(
        &self,
        agent_id: &str,
        process: &ProcessRef,
    ) -> Result<WorkerHandle, SupervisorError> {
        warn!(
            "Start of worker for agent {} was interrupted, terminating {}",
            agent_id, process
        );
        if let Err(e) = self.terminate_bounded(process).await {
            warn!("Terminate of interrupted worker {} failed: {}", process, e);
        }
        Err(SupervisorError::Interrupted {
            agent_id: agent_id.to_string(),
        })
    }

    async fn await_healthy(
        &self,
        agent_id: &str,
        instance_id: Uuid,
        process: ProcessRef,
    ) -> Result<WorkerHandle, SupervisorError> {
        let probe_timeout = self.config.probe_timeout();
        let deadline = Instant::now() + self.config.startup_timeout();
        let mut last_error = String::from("no health check attempted");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let bound = probe_timeout.min(remaining).max(Duration::from_millis(1));

            match self.check(&process, bound).await {
                Ok(activity) => {
                    let mut slots = self.slots.lock().await;
                    return match slots.get_mut(agent_id) {
                        Some(slot)
                            if slot.owned_by(instance_id)
                                && slot.handle.state == WorkerState::Starting =>
                        {
                            slot.handle.state = WorkerState::Running;
                            slot.handle.last_heartbeat_at = Some(Utc::now());
                            slot.handle.last_activity = Some(activity);
                            info!("Worker for agent {} is running", agent_id);
                            Ok(slot.handle.clone())
                        }
                        _ => Err(SupervisorError::Interrupted {
                            agent_id: agent_id.to_string(),
                        }),
                    };
                }
                Err(e) => {
                    debug!("Worker for agent {} not healthy yet: {}", agent_id, e);
                    last_error = e.to_string();
                }
            }

            if !self.still_starting(agent_id, instance_id).await {
                return Err(SupervisorError::Interrupted {
                    agent_id: agent_id.to_string(),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.config.health_poll_interval().min(remaining)).await;
        }

        let mut slots = self.slots.lock().await;
        match slots.get_mut(agent_id) {
            Some(slot) if slot.owned_by(instance_id) && slot.handle.state == WorkerState::Starting => {
                slot.handle.state = WorkerState::Unreachable;
                slot.handle.last_error = Some(format!(
                    "no healthy answer within {}ms: {}",
                    self.config.startup_timeout_ms, last_error
                ));
                warn!(
                    "Worker for agent {} did not become healthy within {}ms",
                    agent_id, self.config.startup_timeout_ms
                );
                Ok(slot.handle.clone())
            }
            _ => Err(SupervisorError::Interrupted {
                agent_id: agent_id.to_string(),
            }),
        }
    }

    async fn still_starting(&self, agent_id: &str, instance_id: Uuid) -> bool {
        let slots = self.slots.lock().await;
        slots
            .get(agent_id)
            .map(|s| s.owned_by(instance_id) && s.handle.state == WorkerState::Starting)
            .unwrap_or(false)
    }

    /// Health check bounded by `timeout` regardless of the runtime
    async fn check(
        &self,
        process: &ProcessRef,
        timeout: Duration,
    ) -> Result<WorkerActivity, RuntimeError> {
        tokio::time::timeout(timeout, self.runtime.health_check(process, timeout))
            .await
            .unwrap_or(Err(RuntimeError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            }))
    }

    async fn terminate_bounded(&self, process: &ProcessRef) -> Result<(), RuntimeError> {
        let grace = self.config.stop_grace();
        tokio::time::timeout(grace + KILL_MARGIN, self.runtime.terminate(process, grace))
            .await
            .unwrap_or(Err(RuntimeError::Timeout {
                elapsed_ms: (grace + KILL_MARGIN).as_millis() as u64,
            }))
    }

    /// Query the worker's health surface.
    ///
    /// A failed check marks the worker `Unreachable` but does not stop it;
    /// a later successful check brings it back to `Running`.
    pub async fn probe(&self, agent_id: &str) -> Result<WorkerHandle, SupervisorError> {
        let (process, instance_id) = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .get_mut(agent_id)
                .ok_or_else(|| SupervisorError::NotRunning {
                    agent_id: agent_id.to_string(),
                })?;

            match slot.handle.state {
                WorkerState::Stopped => {
                    return Err(SupervisorError::NotRunning {
                        agent_id: agent_id.to_string(),
                    })
                }
                // A start or stop is in flight and owns the transition
                WorkerState::Starting | WorkerState::Stopping => return Ok(slot.handle.clone()),
                WorkerState::Running | WorkerState::Unreachable => {}
            }

            match (slot.process.clone(), slot.handle.instance_id) {
                (Some(process), Some(instance_id)) => (process, instance_id),
                _ => {
                    slot.handle.state = WorkerState::Unreachable;
                    slot.handle.last_error = Some("no process attached".to_string());
                    return Ok(slot.handle.clone());
                }
            }
        };

        let result = self.check(&process, self.config.probe_timeout()).await;

        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(agent_id)
            .ok_or_else(|| SupervisorError::NotRunning {
                agent_id: agent_id.to_string(),
            })?;

        if !slot.owned_by(instance_id) || !slot.handle.state.is_probeable() {
            return Ok(slot.handle.clone());
        }

        match result {
            Ok(activity) => {
                if slot.handle.state == WorkerState::Unreachable {
                    info!("Worker for agent {} recovered", agent_id);
                }
                slot.handle.state = WorkerState::Running;
                slot.handle.last_heartbeat_at = Some(Utc::now());
                slot.handle.last_activity = Some(activity);
                slot.handle.last_error = None;
            }
            Err(e) => {
                if slot.handle.state == WorkerState::Running {
                    warn!("Worker for agent {} became unreachable: {}", agent_id, e);
                } else {
                    debug!("Worker for agent {} still unreachable: {}", agent_id, e);
                }
                slot.handle.state = WorkerState::Unreachable;
                slot.handle.last_error = Some(e.to_string());
            }
        }
        Ok(slot.handle.clone())
    }

    /// Stop the worker for `agent_id`.
    ///
    /// Stopping an already stopped worker is a no-op success; only an agent
    /// that never had a worker is `NotRunning`.
    pub async fn stop(&self, agent_id: &str) -> Result<WorkerHandle, SupervisorError> {
        let (process, instance_id) = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .get_mut(agent_id)
                .ok_or_else(|| SupervisorError::NotRunning {
                    agent_id: agent_id.to_string(),
                })?;

            match slot.handle.state {
                WorkerState::Stopped => {
                    debug!("Worker for agent {} already stopped", agent_id);
                    return Ok(slot.handle.clone());
                }
                WorkerState::Stopping => return Ok(slot.handle.clone()),
                _ => {}
            }

            info!(
                "Stopping worker for agent {} (was {})",
                agent_id, slot.handle.state
            );
            slot.handle.state = WorkerState::Stopping;
            (slot.process.take(), slot.handle.instance_id)
        };

        let mut terminate_error = None;
        if let Some(process) = process {
            if let Err(e) = self.terminate_bounded(&process).await {
                warn!("Terminate of worker {} failed: {}", process, e);
                terminate_error = Some(e.to_string());
            }
        }

        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(agent_id)
            .ok_or_else(|| SupervisorError::NotRunning {
                agent_id: agent_id.to_string(),
            })?;

        if slot.handle.instance_id == instance_id && slot.handle.state == WorkerState::Stopping {
            slot.handle.state = WorkerState::Stopped;
            if terminate_error.is_some() {
                slot.handle.last_error = terminate_error;
            }
            info!("Worker for agent {} stopped", agent_id);
        }
        Ok(slot.handle.clone())
    }

    /// Stop every worker that still owns a process
    pub async fn stop_all(&self) -> Vec<WorkerHandle> {
        let agents: Vec<String> = {
            let slots = self.slots.lock().await;
            slots
                .iter()
                .filter(|(_, s)| s.handle.state.needs_stop())
                .map(|(id, _)| id.clone())
                .collect()
        };

        if !agents.is_empty() {
            info!("Stopping {} workers", agents.len());
        }

        join_all(agents.iter().map(|id| self.stop(id)))
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    /// Recent log lines of the agent's worker; empty when unavailable
    pub async fn logs(&self, agent_id: &str) -> Vec<String> {
        let process = {
            let slots = self.slots.lock().await;
            slots.get(agent_id).and_then(|s| s.process.clone())
        };
        let Some(process) = process else {
            return Vec::new();
        };

        match tokio::time::timeout(LOG_TIMEOUT, self.runtime.logs(&process, LOG_TIMEOUT)).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                warn!("Could not read logs of worker {}: {}", process, e);
                Vec::new()
            }
            Err(_) => {
                warn!("Log request to worker {} timed out", process);
                Vec::new()
            }
        }
    }

    /// Snapshot of one agent's worker
    pub async fn handle(&self, agent_id: &str) -> Option<WorkerHandle> {
        let slots = self.slots.lock().await;
        slots.get(agent_id).map(|s| s.handle.clone())
    }

    /// Snapshots of all known workers, ordered by agent id
    pub async fn handles(&self) -> Vec<WorkerHandle> {
        let slots = self.slots.lock().await;
        let mut handles: Vec<_> = slots.values().map(|s| s.handle.clone()).collect();
        handles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SimulatedRuntime;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            startup_timeout_ms: 200,
            health_poll_interval_ms: 20,
            probe_timeout_ms: 50,
            stop_grace_ms: 50,
        }
    }

    fn supervisor() -> (Arc<SimulatedRuntime>, WorkerSupervisor) {
        let runtime = Arc::new(SimulatedRuntime::new());
        let supervisor = WorkerSupervisor::new(runtime.clone(), fast_config());
        (runtime, supervisor)
    }

    #[tokio::test]
    async fn test_start_reaches_running() {
        let (runtime, supervisor) = supervisor();

        let handle = supervisor.start("A-01").await.unwrap();
        assert_eq!(handle.state, WorkerState::Running);
        assert!(handle.last_heartbeat_at.is_some());
        assert!(handle.last_activity.is_some());
        assert_eq!(runtime.live_workers("A-01"), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let (runtime, supervisor) = supervisor();
        supervisor.start("A-01").await.unwrap();

        let err = supervisor.start("A-01").await.unwrap_err();
        assert_eq!(
            err,
            SupervisorError::AlreadyRunning {
                agent_id: "A-01".into()
            }
        );
        assert_eq!(runtime.spawn_count("A-01"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_start_yields_one_worker() {
        let (runtime, supervisor) = supervisor();

        let (a, b) = tokio::join!(supervisor.start("A-01"), supervisor.start("A-01"));
        let results = [a, b];

        let running = results
            .iter()
            .filter(|r| matches!(r, Ok(h) if h.state == WorkerState::Running))
            .count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(SupervisorError::AlreadyRunning { .. })))
            .count();
        assert_eq!((running, rejected), (1, 1));
        assert_eq!(runtime.live_workers("A-01"), 1);
    }

    #[tokio::test]
    async fn test_start_timeout_marks_unreachable() {
        let (runtime, supervisor) = supervisor();
        runtime.set_healthy("A-01", false);

        let started = std::time::Instant::now();
        let handle = supervisor.start("A-01").await.unwrap();

        assert_eq!(handle.state, WorkerState::Unreachable);
        assert!(handle.last_error.is_some());
        assert!(started.elapsed() < Duration::from_secs(2));
        // The process is kept; unreachable is not a kill trigger
        assert_eq!(runtime.live_workers("A-01"), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (runtime, supervisor) = supervisor();
        runtime.set_spawn_failure("A-01", true);

        let err = supervisor.start("A-01").await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessSpawnFailure { .. }));
        assert_eq!(
            supervisor.handle("A-01").await.unwrap().state,
            WorkerState::Stopped
        );

        // A later attempt may succeed
        runtime.set_spawn_failure("A-01", false);
        assert!(supervisor.start("A-01").await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_restart_cleans_up_unreachable_worker() {
        let (runtime, supervisor) = supervisor();
        runtime.set_healthy("A-01", false);
        supervisor.start("A-01").await.unwrap();
        assert_eq!(runtime.live_workers("A-01"), 1);

        runtime.set_healthy("A-01", true);
        let handle = supervisor.start("A-01").await.unwrap();
        assert!(handle.is_running());
        assert_eq!(runtime.spawn_count("A-01"), 2);
        assert_eq!(runtime.live_workers("A-01"), 1);
    }

    #[tokio::test]
    async fn test_probe_transitions_and_recovers() {
        let (runtime, supervisor) = supervisor();
        supervisor.start("A-01").await.unwrap();

        runtime.set_healthy("A-01", false);
        let handle = supervisor.probe("A-01").await.unwrap();
        assert_eq!(handle.state, WorkerState::Unreachable);
        assert_eq!(runtime.live_workers("A-01"), 1);

        runtime.set_healthy("A-01", true);
        let handle = supervisor.probe("A-01").await.unwrap();
        assert_eq!(handle.state, WorkerState::Running);
        assert!(handle.last_error.is_none());
    }

    #[tokio::test]
    async fn test_probe_unknown_agent_is_not_running() {
        let (_, supervisor) = supervisor();
        assert!(matches!(
            supervisor.probe("ghost").await,
            Err(SupervisorError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (runtime, supervisor) = supervisor();
        supervisor.start("A-01").await.unwrap();

        let first = assert_ok!(supervisor.stop("A-01").await);
        let second = assert_ok!(supervisor.stop("A-01").await);
        assert_eq!(first.state, WorkerState::Stopped);
        assert_eq!(second, first);
        assert_eq!(runtime.live_workers("A-01"), 0);

        assert_err!(supervisor.stop("ghost").await);
        assert!(matches!(
            supervisor.probe("A-01").await,
            Err(SupervisorError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_all_stops_every_live_worker() {
        let (runtime, supervisor) = supervisor();
        supervisor.start("A-01").await.unwrap();
        runtime.set_healthy("A-13", false);
        supervisor.start("A-13").await.unwrap();

        let stopped = supervisor.stop_all().await;
        assert_eq!(stopped.len(), 2);
        assert!(supervisor
            .handles()
            .await
            .iter()
            .all(|h| h.state == WorkerState::Stopped));
        assert_eq!(runtime.live_workers("A-01") + runtime.live_workers("A-13"), 0);
    }

    #[tokio::test]
    async fn test_logs_fall_back_to_empty() {
        let (_, supervisor) = supervisor();
        assert!(supervisor.logs("A-01").await.is_empty());

        supervisor.start("A-01").await.unwrap();
        assert_eq!(supervisor.logs("A-01").await.len(), 1);
    }

    /// Runtime whose health check never returns
    struct HangingRuntime(SimulatedRuntime);

    #[async_trait]
    impl WorkerRuntime for HangingRuntime {
        async fn spawn(&self, agent_id: &str) -> Result<ProcessRef, RuntimeError> {
            self.0.spawn(agent_id).await
        }

        async fn health_check(
            &self,
            _process: &ProcessRef,
            _timeout: Duration,
        ) -> Result<WorkerActivity, RuntimeError> {
            futures::future::pending().await
        }

        async fn terminate(&self, process: &ProcessRef, grace: Duration) -> Result<(), RuntimeError> {
            self.0.terminate(process, grace).await
        }
    }

    #[tokio::test]
    async fn test_hanging_health_check_is_bounded() {
        let supervisor = WorkerSupervisor::new(
            Arc::new(HangingRuntime(SimulatedRuntime::new())),
            fast_config(),
        );

        let handle = supervisor.start("A-01").await.unwrap();
        assert_eq!(handle.state, WorkerState::Unreachable);

        let handle = supervisor.probe("A-01").await.unwrap();
        assert_eq!(handle.state, WorkerState::Unreachable);
    }

    #[tokio::test]
    async fn test_stop_during_start_interrupts_it() {
        let runtime = Arc::new(SimulatedRuntime::new());
        runtime.set_healthy("A-01", false);
        let supervisor = Arc::new(WorkerSupervisor::new(
            runtime.clone(),
            SupervisorConfig {
                startup_timeout_ms: 5_000,
                ..fast_config()
            },
        ));

        let starter = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start("A-01").await })
        };

        // Let the start get past spawning
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stopped = supervisor.stop("A-01").await.unwrap();
        assert_eq!(stopped.state, WorkerState::Stopped);

        let result = starter.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::Interrupted { .. })));
        assert_eq!(runtime.live_workers("A-01"), 0);
    }
}
