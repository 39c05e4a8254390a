use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Worker lifecycle states
///
/// `Stopped -> Starting -> Running <-> Unreachable -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    /// Health surface not answering; recoverable by a successful probe
    Unreachable,
    Stopping,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Unreachable => "unreachable",
            WorkerState::Stopping => "stopping",
        }
    }

    /// A process is (or is about to be) alive for this agent
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Running)
    }

    /// States that own a process that still has to be stopped
    pub fn needs_stop(&self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Running | WorkerState::Unreachable
        )
    }

    /// States a health probe is meaningful in
    pub fn is_probeable(&self) -> bool {
        matches!(self, WorkerState::Running | WorkerState::Unreachable)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Activity report returned by a worker's health surface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerActivity {
    /// Opportunity the worker is pursuing (e.g. "Faucet-Harvester")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_hrs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_hrs: Option<f64>,
}

/// Supervisor's view of one agent's worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub agent_id: String,
    pub state: WorkerState,
    /// Incarnation of the underlying process; changes on every start
    pub instance_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_activity: Option<WorkerActivity>,
    pub last_error: Option<String>,
}

impl WorkerHandle {
    pub fn stopped(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: WorkerState::Stopped,
            instance_id: None,
            started_at: None,
            last_heartbeat_at: None,
            last_activity: None,
            last_error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }
}
