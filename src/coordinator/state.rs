//! Engine status views read by the request layer and the CLI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Proposal, ProposalStatus, TreasuryState, WorkerHandle, WorkerState};

/// Per-agent status as seen by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub worker_state: WorkerState,
    pub worker: Option<WorkerHandle>,
    /// Ticks in a row the funded worker failed its probe
    pub consecutive_unreachable: u32,
    /// Set once the engine gave up on the worker and stopped it
    pub failed: bool,
    pub failure_reason: Option<String>,
}

/// Proposal counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalCounts {
    pub pending: usize,
    pub awaiting_approval: usize,
    pub funded: usize,
    pub rejected: usize,
}

impl ProposalCounts {
    pub fn from_proposals<'a>(proposals: impl IntoIterator<Item = &'a Proposal>) -> Self {
        let mut counts = Self::default();
        for proposal in proposals {
            match proposal.status {
                ProposalStatus::Pending => counts.pending += 1,
                ProposalStatus::AwaitingApproval => counts.awaiting_approval += 1,
                ProposalStatus::Funded => counts.funded += 1,
                ProposalStatus::Rejected => counts.rejected += 1,
            }
        }
        counts
    }
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub tick_count: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Treasury reading used by the most recent tick
    pub treasury: Option<TreasuryState>,
    pub proposals: ProposalCounts,
    /// Pending proposals held back by the treasury reserve
    pub balance_locked: Vec<String>,
    pub agents: Vec<AgentReport>,
}

impl EngineSnapshot {
    pub fn agent(&self, agent_id: &str) -> Option<&AgentReport> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    pub fn failed_agents(&self) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|a| a.failed)
            .map(|a| a.agent_id.as_str())
            .collect()
    }
}

/// A worker start that did not produce a running worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFailure {
    pub agent_id: String,
    pub reason: String,
}

/// What one tick did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    pub treasury: TreasuryState,
    /// Pending proposals moved to `AwaitingApproval`
    pub approved: Vec<String>,
    /// Pending proposals left waiting on the reserve
    pub balance_locked: Vec<String>,
    /// Agents whose worker was launched this tick
    pub started: Vec<String>,
    /// Proposals marked `Funded`
    pub funded: Vec<String>,
    pub start_failures: Vec<StartFailure>,
    /// Funded agents whose probe failed this tick
    pub unreachable: Vec<String>,
    /// Agents stopped after too many unreachable ticks
    pub escalated: Vec<String>,
    pub elapsed_ms: u64,
}

impl TickReport {
    pub fn new(tick: u64, treasury: TreasuryState) -> Self {
        Self {
            tick,
            treasury,
            approved: Vec::new(),
            balance_locked: Vec::new(),
            started: Vec::new(),
            funded: Vec::new(),
            start_failures: Vec::new(),
            unreachable: Vec::new(),
            escalated: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Whether the tick changed any proposal
    pub fn changed_ledger(&self) -> bool {
        !self.approved.is_empty() || !self.funded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_proposal_counts() {
        let mut funded = Proposal::new("p2", "A-02", "lp", dec!(0.05), dec!(0.5));
        funded.status = ProposalStatus::Funded;
        let proposals = vec![
            Proposal::new("p1", "A-01", "faucet", dec!(0), dec!(0.1)),
            funded,
        ];

        let counts = ProposalCounts::from_proposals(&proposals);
        assert_eq!(
            counts,
            ProposalCounts {
                pending: 1,
                funded: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_tick_report_change_detection() {
        let mut report = TickReport::new(1, TreasuryState::simulated("0xabc", dec!(0)));
        assert!(!report.changed_ledger());

        report.balance_locked.push("p2".into());
        assert!(!report.changed_ledger());

        report.approved.push("p1".into());
        assert!(report.changed_ledger());
    }
}
