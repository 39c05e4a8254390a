use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proposal funding state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Submitted, not yet evaluated
    Pending,
    /// Approved and queued for funding
    AwaitingApproval,
    /// Funding recorded (terminal)
    Funded,
    /// Rejected (terminal)
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::AwaitingApproval => "awaiting_approval",
            ProposalStatus::Funded => "funded",
            ProposalStatus::Rejected => "rejected",
        }
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: ProposalStatus) -> bool {
        use ProposalStatus::*;

        match (self, target) {
            (Pending, AwaitingApproval) => true,
            (AwaitingApproval, Funded) => true,
            (Pending, Rejected) | (AwaitingApproval, Rejected) => true,
            _ => false,
        }
    }

    /// Get valid next statuses from the current one
    pub fn valid_transitions(&self) -> Vec<ProposalStatus> {
        use ProposalStatus::*;

        match self {
            Pending => vec![AwaitingApproval, Rejected],
            AwaitingApproval => vec![Funded, Rejected],
            Funded | Rejected => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Funded | ProposalStatus::Rejected)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ProposalStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ProposalStatus::Pending),
            "awaiting_approval" => Ok(ProposalStatus::AwaitingApproval),
            "funded" => Ok(ProposalStatus::Funded),
            "rejected" => Ok(ProposalStatus::Rejected),
            _ => Err(format!("Unknown proposal status: {}", s)),
        }
    }
}

/// A request to fund and run one agent worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub agent_id: String,
    pub purpose: String,
    /// Funding cost in the chain's native unit
    pub cost: Decimal,
    /// Expected monthly revenue in the chain's native unit
    pub expected_revenue: Decimal,
    pub status: ProposalStatus,
    /// Held back because the treasury sits at or below the reserve
    #[serde(default)]
    pub balance_locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    /// New proposal in `Pending`
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        purpose: impl Into<String>,
        cost: Decimal,
        expected_revenue: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            purpose: purpose.into(),
            cost,
            expected_revenue,
            status: ProposalStatus::Pending,
            balance_locked: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Zero-cost proposals never need treasury backing
    pub fn is_free(&self) -> bool {
        self.cost.is_zero()
    }
}

/// Proposal transition record (for logging/audit)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalTransition {
    pub proposal_id: String,
    pub from: ProposalStatus,
    pub to: ProposalStatus,
    pub timestamp: DateTime<Utc>,
}

impl ProposalTransition {
    pub fn new(proposal_id: impl Into<String>, from: ProposalStatus, to: ProposalStatus) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }
}
