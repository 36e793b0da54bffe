//! Goal domain model.
//!
//! Goals are high-level objectives submitted from outside. The orchestrator
//! decomposes each goal into a DAG of tasks, monitors their completion, and
//! verifies the outcome. Every status change is recorded in an append-only
//! history that is written atomically with the status itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verification attempts allowed before a goal fails for human review.
pub const MAX_VERIFICATION_RETRIES: u32 = 2;

/// Lifecycle status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Accepted into the backlog, not yet picked up.
    Submitted,
    /// The orchestrator is decomposing it into tasks.
    Decomposing,
    /// Child tasks are queued or running.
    Executing,
    /// All children finished; outcome verification in flight.
    Verifying,
    /// Verified successfully.
    Complete,
    /// Ended without success.
    Failed,
}

impl Default for GoalStatus {
    fn default() -> Self {
        Self::Submitted
    }
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Decomposing => "decomposing",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "submitted" => Some(Self::Submitted),
            "decomposing" => Some(Self::Decomposing),
            "executing" => Some(Self::Executing),
            "verifying" => Some(Self::Verifying),
            "complete" | "completed" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Valid transitions from this status.
    ///
    /// `Verifying -> Executing` is the verification-retry loop: follow-up
    /// tasks are created for the reported gaps and the goal re-enters
    /// execution.
    pub fn valid_transitions(&self) -> &'static [GoalStatus] {
        match self {
            Self::Submitted => &[Self::Decomposing, Self::Failed],
            Self::Decomposing => &[Self::Executing, Self::Failed],
            Self::Executing => &[Self::Verifying, Self::Failed],
            Self::Verifying => &[Self::Complete, Self::Executing, Self::Failed],
            Self::Complete | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Check if the goal currently has (or may have) live tasks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Decomposing | Self::Executing | Self::Verifying)
    }
}

/// Where a goal was submitted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalSource {
    Api,
    Cli,
    Internal,
}

impl Default for GoalSource {
    fn default() -> Self {
        Self::Api
    }
}

impl GoalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Cli => "cli",
            Self::Internal => "internal",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "api" => Some(Self::Api),
            "cli" => Some(Self::Cli),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Priority level for goals. Higher values dequeue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for GoalPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl GoalPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// One entry of the append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalTransition {
    pub from: GoalStatus,
    pub to: GoalStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A high-level objective that decomposes into a DAG of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Unique identifier.
    pub id: Uuid,
    /// Short human-readable title.
    pub title: String,
    /// Detailed description handed to the decomposer.
    pub description: String,
    /// Conditions the overall outcome must satisfy.
    pub success_criteria: Vec<String>,
    /// Priority lane.
    pub priority: GoalPriority,
    /// Where the goal came from.
    pub source: GoalSource,
    /// Target repository URL, resolved from the registry when omitted.
    pub repo: Option<String>,
    /// Free-form metadata carried through untouched.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Current status.
    pub status: GoalStatus,
    /// Append-only transition history.
    pub history: Vec<GoalTransition>,
    /// Verification attempts consumed so far.
    pub verification_retries: u32,
    /// When created.
    pub created_at: DateTime<Utc>,
    /// When last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    /// Create a new goal in the `submitted` state.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            success_criteria: Vec::new(),
            priority: GoalPriority::default(),
            source: GoalSource::default(),
            repo: None,
            metadata: serde_json::Value::Null,
            status: GoalStatus::default(),
            history: Vec::new(),
            verification_retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: GoalPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the source.
    pub fn with_source(mut self, source: GoalSource) -> Self {
        self.source = source;
        self
    }

    /// Set the target repository.
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// Add a success criterion.
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.success_criteria.push(criterion.into());
        self
    }

    pub fn can_transition_to(&self, new_status: GoalStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, appending the history entry.
    ///
    /// The repository persists the status column and the history blob in one
    /// write, so the history always reflects a valid lifecycle path.
    pub fn transition_to(
        &mut self,
        new_status: GoalStatus,
        reason: impl Into<String>,
    ) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.history.push(GoalTransition {
            from: self.status,
            to: new_status,
            reason: reason.into(),
            at: Utc::now(),
        });
        self.status = new_status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Check if another verification attempt is allowed.
    pub fn can_retry_verification(&self) -> bool {
        self.verification_retries < MAX_VERIFICATION_RETRIES
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Validate the goal at submission.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Goal title cannot be empty".to_string());
        }
        if self.title.len() > 255 {
            return Err("Goal title cannot exceed 255 characters".to_string());
        }
        if self.description.trim().is_empty() {
            return Err("Goal description cannot be empty".to_string());
        }
        Ok(())
    }
}
