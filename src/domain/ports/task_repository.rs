//! Task repository port.
//!
//! The queue service owns all task mutations; the repository exposes the
//! atomic primitives it needs. Generation-fenced operations are conditional
//! updates: a stale generation affects zero rows and surfaces as `None`,
//! never as an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskPriority, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub goal_id: Option<Uuid>,
    pub assigned_to: Option<String>,
}

/// Child-task tallies for one goal. Dead-lettered children count as failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GoalProgress {
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
}

impl GoalProgress {
    /// All children finished and none failed.
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.failed == 0 && self.completed > 0
    }
}

/// Outcome of a fenced failure report.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Retry budget remained; the task is back in the queue.
    Retried(Task),
    /// Retries exhausted; the task moved to the dead-letter table.
    DeadLettered(Task),
}

/// Repository interface for task persistence.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task.
    async fn create(&self, task: &Task) -> DomainResult<()>;

    /// Get a task by id.
    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// Full-row update. Prefer the atomic operations for status changes.
    async fn update(&self, task: &Task) -> DomainResult<()>;

    /// Atomically assign a queued task to an agent.
    ///
    /// Conditional on `status = queued` and `generation = expected`; the
    /// generation is incremented as part of the same write. Returns the
    /// updated task, or `None` when the condition failed.
    async fn assign_atomic(
        &self,
        task_id: Uuid,
        agent_id: &str,
        expected_generation: u64,
    ) -> DomainResult<Option<Task>>;

    /// Move an assigned task to in-progress, fenced on generation.
    async fn mark_in_progress(&self, task_id: Uuid, generation: u64) -> DomainResult<Option<Task>>;

    /// Record a progress heartbeat: refreshes `updated_at`, fenced on generation.
    async fn touch(&self, task_id: Uuid, generation: u64) -> DomainResult<bool>;

    /// Complete a task, fenced on generation. `None` means the report was stale.
    async fn complete_atomic(
        &self,
        task_id: Uuid,
        generation: u64,
        result: Option<serde_json::Value>,
    ) -> DomainResult<Option<Task>>;

    /// Fail a task, fenced on generation. Requeues with an incremented
    /// retry count, or moves the row to the dead-letter table in the same
    /// transaction once retries are exhausted. `None` means stale.
    async fn fail_atomic(
        &self,
        task_id: Uuid,
        generation: u64,
        reason: &str,
    ) -> DomainResult<Option<FailOutcome>>;

    /// Return a held task to the queue with a bumped generation.
    ///
    /// Used by the acceptance timeout, the stuck sweep, disconnects, and
    /// healing. Works from `assigned` or `in_progress`; `None` when the
    /// task is not currently held.
    async fn requeue(&self, task_id: Uuid, reason: &str) -> DomainResult<Option<Task>>;

    /// Queued tasks ordered by priority lane then age.
    async fn list_queued_ordered(&self) -> DomainResult<Vec<Task>>;

    /// List tasks with optional filters.
    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// All tasks belonging to a goal.
    async fn tasks_for_goal(&self, goal_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Child-task tallies for a goal.
    async fn goal_progress(&self, goal_id: Uuid) -> DomainResult<GoalProgress>;

    /// Held tasks whose `updated_at` is older than the cutoff.
    async fn stuck_tasks(&self, older_than: DateTime<Utc>) -> DomainResult<Vec<Task>>;

    /// Dead-letter queued tasks created before the cutoff; returns them.
    async fn expire_queued(&self, created_before: DateTime<Utc>) -> DomainResult<Vec<Task>>;

    /// List the dead-letter table.
    async fn dead_letters(&self) -> DomainResult<Vec<Task>>;

    /// Move a dead-lettered task back to queued with a fresh retry budget.
    async fn retry_dead_letter(&self, task_id: Uuid) -> DomainResult<Option<Task>>;

    /// Count live tasks by status.
    async fn count_by_status(&self) -> DomainResult<std::collections::HashMap<TaskStatus, u64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_progress_complete() {
        assert!(GoalProgress { pending: 0, completed: 3, failed: 0 }.is_complete());
        assert!(!GoalProgress { pending: 1, completed: 2, failed: 0 }.is_complete());
        assert!(!GoalProgress { pending: 0, completed: 2, failed: 1 }.is_complete());
        // A goal with no submitted children is not complete.
        assert!(!GoalProgress::default().is_complete());
    }
}
