//! Hub state machine domain model.
//!
//! The hub is a singleton controller cycling between resting, executing,
//! improving, contemplating, and healing. The states and history records
//! are plain data; the tick loop and the transition predicates live in the
//! services layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Transition history entries retained.
pub const HISTORY_CAPACITY: usize = 200;

/// State of the autonomous hub cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    /// Nothing to do; waiting for goals.
    Resting,
    /// Driving goals through the orchestrator.
    Executing,
    /// Self-improvement pass over the hub's own repositories.
    Improving,
    /// Generating proposals for future work.
    Contemplating,
    /// Running remediation for a critical health issue.
    Healing,
}

impl Default for HubState {
    fn default() -> Self {
        Self::Resting
    }
}

impl HubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resting => "resting",
            Self::Executing => "executing",
            Self::Improving => "improving",
            Self::Contemplating => "contemplating",
            Self::Healing => "healing",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "resting" => Some(Self::Resting),
            "executing" => Some(Self::Executing),
            "improving" => Some(Self::Improving),
            "contemplating" => Some(Self::Contemplating),
            "healing" => Some(Self::Healing),
            _ => None,
        }
    }
}

/// One recorded hub transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubTransition {
    pub from: HubState,
    pub to: HubState,
    pub reason: String,
    pub at: DateTime<Utc>,
    /// Monotonic counter across the process lifetime.
    pub transition_number: u64,
}

/// Bounded ring buffer of hub transitions.
#[derive(Debug, Clone, Default)]
pub struct HubHistory {
    entries: VecDeque<HubTransition>,
    next_number: u64,
}

impl HubHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition, evicting the oldest entry past capacity.
    pub fn record(&mut self, from: HubState, to: HubState, reason: impl Into<String>) -> u64 {
        self.next_number += 1;
        self.entries.push_back(HubTransition {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
            transition_number: self.next_number,
        });
        while self.entries.len() > HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.next_number
    }

    /// Newest-first view of the retained entries.
    pub fn entries(&self) -> Vec<HubTransition> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_transitions(&self) -> u64 {
        self.next_number
    }
}
