//! Task domain model.
//!
//! Tasks are the primary work unit: one task is executed by one agent in
//! one session. Tasks form a DAG through `depends_on` and carry a
//! monotonic `generation` counter that fences stale completions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::routing::RoutingDecision;

/// Soft cap on verification steps; exceeding it emits a warning, never an error.
pub const VERIFICATION_STEPS_SOFT_CAP: usize = 10;

/// Status of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue, unassigned.
    Queued,
    /// Pushed to an agent, acceptance pending.
    Assigned,
    /// Accepted by the agent and running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error (may still be retried).
    Failed,
    /// Retries exhausted; parked in the dead-letter table.
    DeadLettered,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "assigned" => Some(Self::Assigned),
            "in_progress" => Some(Self::InProgress),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }

    /// States in which the task is held by an agent.
    pub fn is_held_by_agent(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Queued => &[Self::Assigned, Self::DeadLettered],
            Self::Assigned => &[Self::InProgress, Self::Queued, Self::Failed],
            Self::InProgress => &[Self::Completed, Self::Failed, Self::Queued],
            Self::Failed => &[Self::Queued, Self::DeadLettered],
            Self::Completed => &[],
            // Dead-lettered tasks never return to the queue directly; the
            // manual retry path resets the row to queued with a fresh
            // retry budget instead.
            Self::DeadLettered => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Priority lane for tasks. Higher values dequeue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
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

    /// One lane up, saturating at urgent. Used for critical verification gaps.
    pub fn bumped(&self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Urgent => Self::Urgent,
        }
    }
}

/// Complexity tier driving routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Standard,
    Complex,
}

impl Default for ComplexityTier {
    fn default() -> Self {
        Self::Standard
    }
}

impl ComplexityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Standard => "standard",
            Self::Complex => "complex",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trivial" => Some(Self::Trivial),
            "standard" => Some(Self::Standard),
            "complex" => Some(Self::Complex),
            _ => None,
        }
    }
}

/// Where the effective tier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexitySource {
    /// Caller named the tier at submission.
    Explicit,
    /// The classifier inferred it from the task shape.
    Inferred,
}

/// Classifier output retained alongside the effective tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredComplexity {
    pub tier: ComplexityTier,
    /// Classifier confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Which signals drove the classification.
    pub signals: Vec<String>,
}

/// Complexity classification for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complexity {
    pub effective_tier: ComplexityTier,
    pub source: ComplexitySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred: Option<InferredComplexity>,
}

impl Complexity {
    pub fn explicit(tier: ComplexityTier) -> Self {
        Self {
            effective_tier: tier,
            source: ComplexitySource::Explicit,
            inferred: None,
        }
    }

    pub fn inferred(inferred: InferredComplexity) -> Self {
        Self {
            effective_tier: inferred.tier,
            source: ComplexitySource::Inferred,
            inferred: Some(inferred),
        }
    }
}

impl Default for Complexity {
    fn default() -> Self {
        Self::explicit(ComplexityTier::Standard)
    }
}

/// A file the task author expects the agent to touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHint {
    pub path: String,
    pub reason: String,
}

/// One check the agent should run before reporting completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStep {
    /// Kind of check (e.g. `command`, `file_exists`, `test`).
    #[serde(rename = "type")]
    pub step_type: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Non-fatal submission findings surfaced back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskWarning {
    pub code: String,
    pub message: String,
}

/// A single unit of work executable by one agent in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning goal, when this task came from a decomposition.
    pub goal_id: Option<Uuid>,
    /// Task ids this one depends on.
    pub depends_on: Vec<Uuid>,
    /// What the agent should do.
    pub description: String,
    /// Source repository URL, resolved at submit time when omitted.
    pub repo: Option<String>,
    /// Branch to work on.
    pub branch: Option<String>,
    /// Files the author expects to be touched.
    pub file_hints: Vec<FileHint>,
    /// Conditions the result must satisfy.
    pub success_criteria: Vec<String>,
    /// Checks the agent runs before completion.
    pub verification_steps: Vec<VerificationStep>,
    /// Capabilities an agent must declare to be eligible for this task.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Complexity classification for routing.
    pub complexity: Complexity,
    /// Priority lane.
    pub priority: TaskPriority,
    /// Current status.
    pub status: TaskStatus,
    /// Retry count.
    pub retry_count: u32,
    /// Maximum retries before dead-lettering.
    pub max_retries: u32,
    /// Monotonic counter incremented on every (re)assignment.
    pub generation: u64,
    /// Agent holding the task, when assigned or in progress.
    pub assigned_to: Option<String>,
    /// When the current assignment was made.
    pub assigned_at: Option<DateTime<Utc>>,
    /// When created.
    pub created_at: DateTime<Utc>,
    /// When last mutated; the stuck sweep keys off this.
    pub updated_at: DateTime<Utc>,
    /// Opaque result map reported by the agent.
    pub result: Option<serde_json::Value>,
    /// Last computed routing decision.
    pub routing_decision: Option<RoutingDecision>,
}

impl Task {
    /// Create a new queued task from a description.
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal_id: None,
            depends_on: Vec::new(),
            description: description.into(),
            repo: None,
            branch: None,
            file_hints: Vec::new(),
            success_criteria: Vec::new(),
            verification_steps: Vec::new(),
            required_capabilities: Vec::new(),
            complexity: Complexity::default(),
            priority: TaskPriority::default(),
            status: TaskStatus::default(),
            retry_count: 0,
            max_retries: 3,
            generation: 0,
            assigned_to: None,
            assigned_at: None,
            created_at: now,
            updated_at: now,
            result: None,
            routing_decision: None,
        }
    }

    /// Set the owning goal.
    pub fn with_goal(mut self, goal_id: Uuid) -> Self {
        self.goal_id = Some(goal_id);
        self
    }

    /// Add a dependency, ignoring self-references and duplicates.
    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) && task_id != self.id {
            self.depends_on.push(task_id);
        }
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the source repository.
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// Set an explicit complexity tier.
    pub fn with_complexity(mut self, tier: ComplexityTier) -> Self {
        self.complexity = Complexity::explicit(tier);
        self
    }

    /// Check if can transition to the given status.
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, touching `updated_at`.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.status = new_status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Check if the task can still be retried after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Check if the task is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Validate the task at submission.
    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("Task description cannot be empty".to_string());
        }
        if self.depends_on.contains(&self.id) {
            return Err("Task cannot depend on itself".to_string());
        }
        Ok(())
    }

    /// Non-fatal findings surfaced to the submitter.
    pub fn warnings(&self) -> Vec<TaskWarning> {
        let mut warnings = Vec::new();
        if self.verification_steps.len() > VERIFICATION_STEPS_SOFT_CAP {
            warnings.push(TaskWarning {
                code: "too_many_verification_steps".to_string(),
                message: format!(
                    "{} verification steps exceed the soft cap of {}",
                    self.verification_steps.len(),
                    VERIFICATION_STEPS_SOFT_CAP
                ),
            });
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation_defaults() {
        let task = Task::new("Fix the flaky login test");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.generation, 0);
        assert_eq!(task.max_retries, 3);
        assert!(task.assigned_to.is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut task = Task::new("t");
        task.transition_to(TaskStatus::Assigned).unwrap();
        task.transition_to(TaskStatus::InProgress).unwrap();
        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.is_terminal());
    }

    #[test]
    fn test_assigned_can_return_to_queue() {
        // Acceptance timeout and sweep-reclaim both requeue an assigned task.
        let mut task = Task::new("t");
        task.transition_to(TaskStatus::Assigned).unwrap();
        assert!(task.transition_to(TaskStatus::Queued).is_ok());
    }

    #[test]
    fn test_dead_letter_is_terminal() {
        let mut task = Task::new("t");
        task.status = TaskStatus::DeadLettered;
        assert!(task.is_terminal());
        assert!(task.status.valid_transitions().is_empty());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut task = Task::new("t");
        // Queued -> InProgress must go through Assigned.
        assert!(task.transition_to(TaskStatus::InProgress).is_err());
        // Queued -> Completed is never valid.
        assert!(task.transition_to(TaskStatus::Completed).is_err());
    }

    #[test]
    fn test_priority_bump_saturates() {
        assert_eq!(TaskPriority::Low.bumped(), TaskPriority::Normal);
        assert_eq!(TaskPriority::High.bumped(), TaskPriority::Urgent);
        assert_eq!(TaskPriority::Urgent.bumped(), TaskPriority::Urgent);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let task = Task::new("t");
        let id = task.id;
        let task = task.with_dependency(id);
        assert!(task.depends_on.is_empty());
    }

    #[test]
    fn test_validation() {
        let task = Task::new("   ");
        assert!(task.validate().is_err());

        let task = Task::new("real work");
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_verification_step_warning() {
        let mut task = Task::new("t");
        for i in 0..11 {
            task.verification_steps.push(VerificationStep {
                step_type: "command".to_string(),
                target: format!("check-{i}"),
                description: None,
            });
        }
        let warnings = task.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, "too_many_verification_steps");

        task.verification_steps.truncate(10);
        assert!(task.warnings().is_empty());
    }

    #[test]
    fn test_complexity_constructors() {
        let c = Complexity::explicit(ComplexityTier::Complex);
        assert_eq!(c.source, ComplexitySource::Explicit);
        assert!(c.inferred.is_none());

        let c = Complexity::inferred(InferredComplexity {
            tier: ComplexityTier::Trivial,
            confidence: 0.8,
            signals: vec!["short_description".to_string()],
        });
        assert_eq!(c.effective_tier, ComplexityTier::Trivial);
        assert_eq!(c.source, ComplexitySource::Inferred);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::DeadLettered,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
    }
}
