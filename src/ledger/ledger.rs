//! Proposal Ledger
//!
//! Holds every funding proposal in insertion order and enforces the
//! proposal state machine. Proposals are never deleted.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::domain::{Proposal, ProposalStatus, ProposalTransition};
use crate::error::LedgerError;

/// In-memory proposal ledger
#[derive(Debug, Clone, Default)]
pub struct ProposalLedger {
    proposals: Vec<Proposal>,
    index: HashMap<String, usize>,
}

impl ProposalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from stored proposals, keeping their recorded status
    pub fn from_proposals(
        proposals: impl IntoIterator<Item = Proposal>,
    ) -> Result<Self, LedgerError> {
        let mut ledger = Self::new();
        for proposal in proposals {
            ledger.insert(proposal)?;
        }
        Ok(ledger)
    }

    fn insert(&mut self, proposal: Proposal) -> Result<(), LedgerError> {
        if self.index.contains_key(&proposal.id) {
            return Err(LedgerError::DuplicateId { id: proposal.id });
        }
        check_amounts(&proposal)?;
        self.index.insert(proposal.id.clone(), self.proposals.len());
        self.proposals.push(proposal);
        Ok(())
    }

    /// Add a new proposal; it always enters as `Pending`
    pub fn submit(&mut self, mut proposal: Proposal) -> Result<Proposal, LedgerError> {
        if self.index.contains_key(&proposal.id) {
            return Err(LedgerError::DuplicateId { id: proposal.id });
        }
        check_amounts(&proposal)?;

        let now = Utc::now();
        proposal.status = ProposalStatus::Pending;
        proposal.balance_locked = false;
        proposal.created_at = now;
        proposal.updated_at = now;

        info!(
            "Proposal {} submitted for agent {} (cost {}, expected revenue {})",
            proposal.id, proposal.agent_id, proposal.cost, proposal.expected_revenue
        );
        self.insert(proposal.clone())?;
        Ok(proposal)
    }

    /// Queue a pending proposal for funding
    pub fn approve(&mut self, id: &str) -> Result<Proposal, LedgerError> {
        self.transition(id, ProposalStatus::AwaitingApproval)
    }

    /// Record that funding happened for an approved proposal
    pub fn mark_funded(&mut self, id: &str) -> Result<Proposal, LedgerError> {
        self.transition(id, ProposalStatus::Funded)
    }

    pub fn reject(&mut self, id: &str) -> Result<Proposal, LedgerError> {
        self.transition(id, ProposalStatus::Rejected)
    }

    fn transition(&mut self, id: &str, to: ProposalStatus) -> Result<Proposal, LedgerError> {
        let proposal = self.get_mut(id)?;
        let from = proposal.status;

        if !from.can_transition_to(to) {
            debug!("Rejected transition for proposal {}: {} -> {}", id, from, to);
            return Err(LedgerError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        proposal.status = to;
        proposal.balance_locked = false;
        proposal.updated_at = Utc::now();

        let transition = ProposalTransition::new(id, from, to);
        info!(
            "Proposal {} transitioned {} -> {}",
            transition.proposal_id, transition.from, transition.to
        );
        Ok(proposal.clone())
    }

    /// Flag (or clear) a pending proposal as held back by the treasury reserve.
    /// Returns whether the flag changed.
    pub fn set_balance_locked(&mut self, id: &str, locked: bool) -> Result<bool, LedgerError> {
        let proposal = self.get_mut(id)?;
        if proposal.status != ProposalStatus::Pending || proposal.balance_locked == locked {
            return Ok(false);
        }
        proposal.balance_locked = locked;
        Ok(true)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Proposal, LedgerError> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| LedgerError::NotFound { id: id.to_string() })?;
        Ok(&mut self.proposals[idx])
    }

    pub fn get(&self, id: &str) -> Option<&Proposal> {
        self.index.get(id).map(|&idx| &self.proposals[idx])
    }

    /// Pending proposals in insertion order
    pub fn list_pending(&self) -> Vec<Proposal> {
        self.list_by_status(ProposalStatus::Pending)
    }

    pub fn list_by_status(&self, status: ProposalStatus) -> Vec<Proposal> {
        self.proposals
            .iter()
            .filter(|p| p.status == status)
            .cloned()
            .collect()
    }

    /// All proposals in insertion order
    pub fn all(&self) -> &[Proposal] {
        &self.proposals
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}

/// Cost is a spend request and can never be negative
fn check_amounts(proposal: &Proposal) -> Result<(), LedgerError> {
    if proposal.cost < Decimal::ZERO {
        return Err(LedgerError::InvalidProposal {
            id: proposal.id.clone(),
            reason: format!("cost must not be negative, got {}", proposal.cost),
        });
    }
    Ok(())
}
