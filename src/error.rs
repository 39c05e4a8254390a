use thiserror::Error;

use crate::domain::ProposalStatus;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum MayaError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Proposal ledger errors
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    // Worker supervision errors
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MayaError
pub type Result<T> = std::result::Result<T, MayaError>;

/// Proposal ledger failures. All of them are locally recoverable; the caller
/// decides what to do next.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Proposal not found: {id}")]
    NotFound { id: String },

    #[error("Invalid transition for proposal {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ProposalStatus,
        to: ProposalStatus,
    },

    #[error("Duplicate proposal id: {id}")]
    DuplicateId { id: String },

    #[error("Invalid proposal {id}: {reason}")]
    InvalidProposal { id: String, reason: String },
}

impl LedgerError {
    /// Stable client-visible error code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::InvalidTransition { .. } => "invalid_transition",
            LedgerError::DuplicateId { .. } => "duplicate_id",
            LedgerError::InvalidProposal { .. } => "invalid_proposal",
        }
    }

    /// HTTP status a request layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::NotFound { .. } => 404,
            LedgerError::InvalidTransition { .. } => 409,
            LedgerError::DuplicateId { .. } => 422,
            LedgerError::InvalidProposal { .. } => 400,
        }
    }

    /// Status the proposal currently holds, when the failure carries one
    pub fn current_status(&self) -> Option<ProposalStatus> {
        match self {
            LedgerError::InvalidTransition { from, .. } => Some(*from),
            _ => None,
        }
    }
}

/// Worker supervision failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Worker for agent {agent_id} is already running")]
    AlreadyRunning { agent_id: String },

    #[error("No worker for agent {agent_id}")]
    NotRunning { agent_id: String },

    #[error("Failed to spawn worker for agent {agent_id}: {reason}")]
    ProcessSpawnFailure { agent_id: String, reason: String },

    #[error("Start of worker for agent {agent_id} was interrupted by a stop")]
    Interrupted { agent_id: String },
}

/// Chain data provider failures. These never leave the balance oracle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Provider connection error: {0}")]
    Connection(String),

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Provider RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Worker runtime (process backend) failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Health check timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Worker unreachable: {0}")]
    Unreachable(String),

    #[error("Worker returned status {0}")]
    BadStatus(u16),

    #[error("Unknown process reference: {0}")]
    UnknownProcess(String),

    #[error("Terminate failed: {0}")]
    TerminateFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_codes_are_distinct() {
        let errors = [
            LedgerError::NotFound { id: "p".into() },
            LedgerError::InvalidTransition {
                id: "p".into(),
                from: ProposalStatus::Funded,
                to: ProposalStatus::Rejected,
            },
            LedgerError::DuplicateId { id: "p".into() },
            LedgerError::InvalidProposal {
                id: "p".into(),
                reason: "negative cost".into(),
            },
        ];

        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.code()).collect();
        let statuses: std::collections::HashSet<_> =
            errors.iter().map(|e| e.http_status()).collect();
        assert_eq!(codes.len(), 4);
        assert_eq!(statuses.len(), 4);
    }

    #[test]
    fn test_invalid_transition_reports_current_status() {
        let err = LedgerError::InvalidTransition {
            id: "prop_001".into(),
            from: ProposalStatus::AwaitingApproval,
            to: ProposalStatus::AwaitingApproval,
        };
        assert_eq!(err.current_status(), Some(ProposalStatus::AwaitingApproval));
        assert!(err.to_string().contains("awaiting_approval"));
    }

    #[test]
    fn test_ledger_error_converts_into_crate_error() {
        let err: MayaError = LedgerError::NotFound { id: "x".into() }.into();
        assert!(matches!(err, MayaError::Ledger(LedgerError::NotFound { .. })));
    }
}
