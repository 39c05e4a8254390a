//! Orchestration Engine
//!
//! The periodic control loop tying proposals to treasury state and worker
//! liveness. Each tick:
//!   1. reads the treasury once and approves eligible `Pending` proposals
//!   2. starts (or confirms) workers for `AwaitingApproval` proposals and
//!      marks them `Funded` once the worker is `Running`
//!   3. probes funded workers and stops those unreachable for too long
//!
//! Per-agent work fans out concurrently. Ledger writes happen under one lock
//! after the fan-out completes, and ticks never overlap.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::state::{AgentReport, EngineSnapshot, ProposalCounts, StartFailure, TickReport};
use crate::config::EngineConfig;
use crate::coordination::{ShutdownPhase, ShutdownToken};
use crate::domain::{
    BalanceSource, Proposal, ProposalStatus, TreasuryState, WorkerHandle, WorkerState,
};
use crate::error::{LedgerError, SupervisorError};
use crate::ledger::{LedgerStore, ProposalLedger};
use crate::oracle::BalanceOracle;
use crate::supervisor::WorkerSupervisor;

/// Engine-side bookkeeping for one agent
#[derive(Debug, Clone, Default)]
struct AgentTracker {
    consecutive_unreachable: u32,
    failed: bool,
    failure_reason: Option<String>,
}

/// Result of bringing up the worker behind approved proposals
enum Readiness {
    /// Worker is `Running`; proposals can be funded
    Ready { started: bool },
    /// Not running yet; try again next tick
    NotReady,
    Failed(String),
}

/// Result of probing a funded worker
enum Liveness {
    Healthy,
    Unreachable(String),
    /// Worker is mid-transition or gone
    Skipped,
}

pub struct OrchestrationEngine {
    config: EngineConfig,
    ledger: RwLock<ProposalLedger>,
    oracle: Arc<BalanceOracle>,
    supervisor: Arc<WorkerSupervisor>,
    store: Option<LedgerStore>,
    agents: RwLock<HashMap<String, AgentTracker>>,
    tick_lock: Mutex<()>,
    tick_count: AtomicU64,
    last_treasury: RwLock<Option<TreasuryState>>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
}

impl OrchestrationEngine {
    pub fn new(
        config: EngineConfig,
        ledger: ProposalLedger,
        oracle: Arc<BalanceOracle>,
        supervisor: Arc<WorkerSupervisor>,
    ) -> Self {
        Self {
            config,
            ledger: RwLock::new(ledger),
            oracle,
            supervisor,
            store: None,
            agents: RwLock::new(HashMap::new()),
            tick_lock: Mutex::new(()),
            tick_count: AtomicU64::new(0),
            last_treasury: RwLock::new(None),
            last_tick_at: RwLock::new(None),
        }
    }

    /// Persist the ledger to `store` after every committed change
    pub fn with_store(mut self, store: LedgerStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    // ==================== Control loop ====================

    /// Run ticks until shutdown, then stop every worker and persist
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        info!(
            "Orchestration loop starting (tick every {}ms, reserve {})",
            self.config.tick_interval_ms, self.config.min_reserve
        );

        let mut interval = tokio::time::interval(self.config.tick_interval());
        // Don't burst-fire ticks missed while a slow tick ran
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                signal = shutdown.wait_for_shutdown() => {
                    info!("Orchestration loop received {} shutdown", signal);
                    break;
                }
            }
        }

        shutdown.set_phase(ShutdownPhase::StoppingTicks);
        // Wait out a tick that may still hold the lock through another caller
        let _tick = self.tick_lock.lock().await;

        shutdown.set_phase(ShutdownPhase::StoppingWorkers);
        self.stop_all_workers().await;

        shutdown.set_phase(ShutdownPhase::PersistingLedger);
        self.persist().await;

        shutdown.set_phase(ShutdownPhase::Complete);
        info!("Orchestration loop exited");
    }

    /// Stop every live worker once an in-flight tick has finished. For
    /// callers that tick without `run`, such as a one-shot CLI tick.
    pub async fn stop_workers(&self) -> usize {
        let _tick = self.tick_lock.lock().await;
        self.stop_all_workers().await
    }

    async fn stop_all_workers(&self) -> usize {
        let stopped = self.supervisor.stop_all().await.len();
        info!("Stopped {} workers", stopped);
        stopped
    }

    /// One pass of the control loop. Never fails; problems with individual
    /// agents end up in the report.
    pub async fn tick(&self) -> TickReport {
        let _tick = self.tick_lock.lock().await;
        let started_at = Instant::now();
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;

        let treasury = self.oracle.treasury().await;
        *self.last_treasury.write().await = Some(treasury.clone());
        let mut report = TickReport::new(tick, treasury);

        self.evaluate_pending(&mut report).await;
        self.fund_approved(&mut report).await;
        self.monitor_funded(&mut report).await;

        if report.changed_ledger() {
            self.persist().await;
        }

        *self.last_tick_at.write().await = Some(Utc::now());
        report.elapsed_ms = started_at.elapsed().as_millis() as u64;

        info!(
            "Tick {} done in {}ms: balance {} ({}), approved {}, locked {}, funded {}, unreachable {}, escalated {}",
            tick,
            report.elapsed_ms,
            report.treasury.balance,
            report.treasury.source,
            report.approved.len(),
            report.balance_locked.len(),
            report.funded.len(),
            report.unreachable.len(),
            report.escalated.len()
        );
        report
    }

    fn treasury_allows_spend(&self, treasury: &TreasuryState) -> bool {
        if self.config.require_live_balance && treasury.source != BalanceSource::Live {
            return false;
        }
        treasury.exceeds(self.config.min_reserve)
    }

    /// Step 1: approve free proposals, and paid ones while the treasury
    /// is above the reserve
    async fn evaluate_pending(&self, report: &mut TickReport) {
        let spend_allowed = self.treasury_allows_spend(&report.treasury);
        let mut ledger = self.ledger.write().await;

        for proposal in ledger.list_pending() {
            if proposal.is_free() || spend_allowed {
                match ledger.approve(&proposal.id) {
                    Ok(_) => report.approved.push(proposal.id),
                    Err(e) => warn!("Could not approve proposal {}: {}", proposal.id, e),
                }
                continue;
            }

            if let Ok(true) = ledger.set_balance_locked(&proposal.id, true) {
                info!(
                    "Proposal {} (cost {}) balance-locked: treasury {} ({}) not above reserve {}",
                    proposal.id,
                    proposal.cost,
                    report.treasury.balance,
                    report.treasury.source,
                    self.config.min_reserve
                );
            }
            report.balance_locked.push(proposal.id);
        }
    }

    /// Step 2: make sure each approved agent has a running worker, then fund
    async fn fund_approved(&self, report: &mut TickReport) {
        let awaiting = {
            let ledger = self.ledger.read().await;
            group_by_agent(ledger.list_by_status(ProposalStatus::AwaitingApproval))
        };
        if awaiting.is_empty() {
            return;
        }

        let failed = self.failed_agents().await;
        let agents: Vec<String> = awaiting
            .keys()
            .filter(|agent_id| {
                let skip = failed.contains(*agent_id);
                if skip {
                    debug!("Agent {} is marked failed, not restarting", agent_id);
                }
                !skip
            })
            .cloned()
            .collect();

        let outcomes = join_all(agents.iter().map(|agent_id| self.ensure_running(agent_id))).await;

        let mut ledger = self.ledger.write().await;
        let mut orphaned = Vec::new();

        for (agent_id, outcome) in agents.iter().zip(outcomes) {
            match outcome {
                Readiness::Ready { started } => {
                    if started {
                        report.started.push(agent_id.clone());
                    }
                    let mut any_funded = false;
                    for proposal_id in &awaiting[agent_id] {
                        match ledger.mark_funded(proposal_id) {
                            Ok(_) => {
                                any_funded = true;
                                report.funded.push(proposal_id.clone());
                            }
                            // Rejected by the request layer while the worker was starting
                            Err(e) => warn!("Could not fund proposal {}: {}", proposal_id, e),
                        }
                    }
                    if !any_funded && !has_funded_proposal(&ledger, agent_id) {
                        orphaned.push(agent_id.clone());
                    }
                }
                Readiness::NotReady => {
                    debug!("Worker for agent {} not running yet, funding deferred", agent_id);
                }
                Readiness::Failed(reason) => {
                    report.start_failures.push(StartFailure {
                        agent_id: agent_id.clone(),
                        reason,
                    });
                }
            }
        }
        drop(ledger);

        for agent_id in orphaned {
            warn!(
                "Agent {} has no fundable proposal left, stopping its worker",
                agent_id
            );
            if let Err(e) = self.supervisor.stop(&agent_id).await {
                warn!("Stop of orphaned worker {} failed: {}", agent_id, e);
            }
        }
    }

    async fn ensure_running(&self, agent_id: &str) -> Readiness {
        let state = self.supervisor.handle(agent_id).await.map(|h| h.state);

        let result = match state {
            Some(WorkerState::Running) => return Readiness::Ready { started: false },
            Some(WorkerState::Starting) | Some(WorkerState::Stopping) => {
                return Readiness::NotReady
            }
            Some(WorkerState::Unreachable) => self.supervisor.probe(agent_id).await,
            None | Some(WorkerState::Stopped) => {
                return match self.supervisor.start(agent_id).await {
                    Ok(handle) if handle.is_running() => Readiness::Ready { started: true },
                    Ok(handle) => {
                        warn!(
                            "Worker for agent {} started but is {}",
                            agent_id, handle.state
                        );
                        Readiness::NotReady
                    }
                    Err(SupervisorError::AlreadyRunning { .. }) => Readiness::NotReady,
                    Err(e) => {
                        error!("Worker start for agent {} failed: {}", agent_id, e);
                        Readiness::Failed(e.to_string())
                    }
                };
            }
        };

        match result {
            Ok(handle) if handle.is_running() => Readiness::Ready { started: false },
            Ok(_) => Readiness::NotReady,
            Err(e) => Readiness::Failed(e.to_string()),
        }
    }

    /// Step 3: probe funded workers and escalate persistent unreachability
    async fn monitor_funded(&self, report: &mut TickReport) {
        let funded_agents: BTreeSet<String> = {
            let ledger = self.ledger.read().await;
            ledger
                .list_by_status(ProposalStatus::Funded)
                .into_iter()
                .map(|p| p.agent_id)
                .collect()
        };

        let mut targets = Vec::new();
        for agent_id in funded_agents {
            // Freshly started this tick; its startup check already counted
            if report.started.contains(&agent_id) {
                continue;
            }
            let probeable = self
                .supervisor
                .handle(&agent_id)
                .await
                .map(|h| h.state.is_probeable())
                .unwrap_or(false);
            if probeable {
                targets.push(agent_id);
            }
        }

        let results = join_all(targets.iter().map(|agent_id| self.check_liveness(agent_id))).await;

        let limit = self.config.max_unreachable_ticks.max(1);
        let mut escalate = Vec::new();
        {
            let mut agents = self.agents.write().await;
            for (agent_id, liveness) in targets.iter().zip(results) {
                let tracker = agents.entry(agent_id.clone()).or_default();
                match liveness {
                    Liveness::Healthy => tracker.consecutive_unreachable = 0,
                    Liveness::Unreachable(reason) => {
                        tracker.consecutive_unreachable += 1;
                        report.unreachable.push(agent_id.clone());
                        warn!(
                            "Funded agent {} unreachable for {}/{} ticks: {}",
                            agent_id, tracker.consecutive_unreachable, limit, reason
                        );
                        if tracker.consecutive_unreachable >= limit {
                            tracker.failed = true;
                            tracker.failure_reason = Some(format!(
                                "unreachable for {} consecutive ticks: {}",
                                tracker.consecutive_unreachable, reason
                            ));
                            escalate.push(agent_id.clone());
                        }
                    }
                    Liveness::Skipped => {}
                }
            }
        }

        if escalate.is_empty() {
            return;
        }

        let stops = join_all(escalate.iter().map(|agent_id| self.supervisor.stop(agent_id))).await;
        for (agent_id, result) in escalate.into_iter().zip(stops) {
            match result {
                Ok(_) => error!(
                    "Agent {} failed: worker stopped after {} unreachable ticks, funding stands",
                    agent_id, limit
                ),
                Err(e) => error!("Agent {} failed and its stop errored: {}", agent_id, e),
            }
            report.escalated.push(agent_id);
        }
    }

    async fn check_liveness(&self, agent_id: &str) -> Liveness {
        match self.supervisor.probe(agent_id).await {
            Ok(handle) => match handle.state {
                WorkerState::Running => Liveness::Healthy,
                WorkerState::Unreachable => Liveness::Unreachable(
                    handle
                        .last_error
                        .unwrap_or_else(|| "health check failed".to_string()),
                ),
                _ => Liveness::Skipped,
            },
            Err(SupervisorError::NotRunning { .. }) => Liveness::Skipped,
            Err(e) => Liveness::Unreachable(e.to_string()),
        }
    }

    async fn failed_agents(&self) -> BTreeSet<String> {
        self.agents
            .read()
            .await
            .iter()
            .filter(|(_, t)| t.failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Save under the write lock so snapshots reach disk in commit order
    async fn persist(&self) {
        let ledger = self.ledger.write().await;
        self.save(&ledger).await;
    }

    async fn save(&self, ledger: &ProposalLedger) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(ledger).await {
            error!(
                "Failed to persist ledger to {}: {}",
                store.path().display(),
                e
            );
        }
    }

    // ==================== Request layer ====================

    pub async fn submit(&self, proposal: Proposal) -> Result<Proposal, LedgerError> {
        let mut ledger = self.ledger.write().await;
        let result = ledger.submit(proposal);
        if result.is_ok() {
            self.save(&ledger).await;
        }
        result
    }

    pub async fn approve(&self, id: &str) -> Result<Proposal, LedgerError> {
        let mut ledger = self.ledger.write().await;
        let result = ledger.approve(id);
        if result.is_ok() {
            self.save(&ledger).await;
        }
        result
    }

    pub async fn reject(&self, id: &str) -> Result<Proposal, LedgerError> {
        let mut ledger = self.ledger.write().await;
        let result = ledger.reject(id);
        if result.is_ok() {
            self.save(&ledger).await;
        }
        result
    }

    /// Record funding done outside the control loop
    pub async fn mark_funded(&self, id: &str) -> Result<Proposal, LedgerError> {
        let mut ledger = self.ledger.write().await;
        let result = ledger.mark_funded(id);
        if result.is_ok() {
            self.save(&ledger).await;
        }
        result
    }

    pub async fn proposal(&self, id: &str) -> Option<Proposal> {
        self.ledger.read().await.get(id).cloned()
    }

    pub async fn list_pending(&self) -> Vec<Proposal> {
        self.ledger.read().await.list_pending()
    }

    pub async fn proposals(&self) -> Vec<Proposal> {
        self.ledger.read().await.all().to_vec()
    }

    /// Fresh treasury reading, outside the tick cadence
    pub async fn treasury(&self) -> TreasuryState {
        self.oracle.treasury().await
    }

    /// Recent log lines of an agent's worker
    pub async fn worker_logs(&self, agent_id: &str) -> Vec<String> {
        self.supervisor.logs(agent_id).await
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let (counts, balance_locked, funded_agents) = {
            let ledger = self.ledger.read().await;
            let locked = ledger
                .list_pending()
                .into_iter()
                .filter(|p| p.balance_locked)
                .map(|p| p.id)
                .collect();
            let funded: BTreeSet<String> = ledger
                .list_by_status(ProposalStatus::Funded)
                .into_iter()
                .map(|p| p.agent_id)
                .collect();
            (ProposalCounts::from_proposals(ledger.all()), locked, funded)
        };

        let handles: BTreeMap<String, WorkerHandle> = self
            .supervisor
            .handles()
            .await
            .into_iter()
            .map(|h| (h.agent_id.clone(), h))
            .collect();
        let trackers = self.agents.read().await.clone();

        // Funded agents appear even with no worker behind them
        let agent_ids: BTreeSet<&String> = handles
            .keys()
            .chain(trackers.keys())
            .chain(funded_agents.iter())
            .collect();
        let agents = agent_ids
            .into_iter()
            .map(|agent_id| {
                let tracker = trackers.get(agent_id).cloned().unwrap_or_default();
                let worker = handles.get(agent_id).cloned();
                AgentReport {
                    agent_id: agent_id.clone(),
                    worker_state: worker
                        .as_ref()
                        .map(|w| w.state)
                        .unwrap_or(WorkerState::Stopped),
                    worker,
                    consecutive_unreachable: tracker.consecutive_unreachable,
                    failed: tracker.failed,
                    failure_reason: tracker.failure_reason,
                }
            })
            .collect();

        EngineSnapshot {
            tick_count: self.tick_count.load(Ordering::SeqCst),
            last_tick_at: *self.last_tick_at.read().await,
            treasury: self.last_treasury.read().await.clone(),
            proposals: counts,
            balance_locked,
            agents,
        }
    }
}

/// Proposal ids per agent, in ledger order
fn group_by_agent(proposals: Vec<Proposal>) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for proposal in proposals {
        grouped.entry(proposal.agent_id).or_default().push(proposal.id);
    }
    grouped
}

fn has_funded_proposal(ledger: &ProposalLedger, agent_id: &str) -> bool {
    ledger
        .all()
        .iter()
        .any(|p| p.agent_id == agent_id && p.status == ProposalStatus::Funded)
}
