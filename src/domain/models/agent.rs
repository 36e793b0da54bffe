//! Agent domain model.
//!
//! An agent is a remote worker process holding one persistent WebSocket
//! connection. The hub keeps a small state machine per connected agent;
//! the states here are plain data, the actor driving them lives in the
//! agent registry service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Runtime state of a connected agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Connected and available for work.
    Idle,
    /// A task was pushed; acceptance pending.
    Assigned,
    /// The agent accepted and is executing.
    Working,
    /// Connection lost; the entry is about to be torn down.
    Disconnected,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Working => "working",
            Self::Disconnected => "disconnected",
        }
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> &'static [AgentState] {
        match self {
            Self::Idle => &[Self::Assigned, Self::Disconnected],
            Self::Assigned => &[Self::Working, Self::Idle, Self::Disconnected],
            Self::Working => &[Self::Idle, Self::Disconnected],
            Self::Disconnected => &[],
        }
    }

    pub fn can_transition_to(&self, new_state: Self) -> bool {
        self.valid_transitions().contains(&new_state)
    }

    /// Whether the agent currently holds a task.
    pub fn holds_task(&self) -> bool {
        matches!(self, Self::Assigned | Self::Working)
    }
}

/// Identity an agent declares during the `identify` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: Option<String>,
    pub capabilities: HashSet<String>,
    pub client_type: Option<String>,
    pub protocol_version: u32,
}

/// The task an agent currently holds, with the generation it was handed.
///
/// The generation travels with every `task_complete`/`task_failed` the
/// agent sends back; a mismatch means the assignment was reclaimed and the
/// report is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: Uuid,
    pub generation: u64,
}

/// Read-model of one agent for dashboards and the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub state: AgentState,
    pub capabilities: HashSet<String>,
    pub current_task_id: Option<Uuid>,
    pub current_generation: Option<u64>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Tasks completed in the recent window; scheduler tie-break key.
    pub recently_completed: u32,
}

impl AgentSnapshot {
    /// Whether this agent can cover the given capability requirements.
    pub fn covers(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}
