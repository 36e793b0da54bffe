//! Goal backlog service.
//!
//! Persistent store of goals with the lifecycle state machine and the
//! priority-ordered dequeue. All mutations append to the goal's history
//! and publish on the goals topic.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Goal, GoalPriority, GoalSource, GoalStatus};
use crate::domain::ports::GoalRepository;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::repo_registry::RepoRegistry;

/// Goal submission parameters.
#[derive(Debug, Clone, Default)]
pub struct SubmitGoal {
    pub title: String,
    pub description: String,
    pub success_criteria: Vec<String>,
    pub priority: Option<GoalPriority>,
    pub source: Option<GoalSource>,
    pub repo: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Backlog counters for the hub FSM's predicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogStats {
    pub submitted: u64,
    pub active: u64,
    pub complete: u64,
    pub failed: u64,
}

pub struct GoalBacklog {
    repo: Arc<dyn GoalRepository>,
    bus: Arc<EventBus>,
    repo_registry: Arc<RepoRegistry>,
}

impl GoalBacklog {
    pub fn new(
        repo: Arc<dyn GoalRepository>,
        bus: Arc<EventBus>,
        repo_registry: Arc<RepoRegistry>,
    ) -> Self {
        Self { repo, bus, repo_registry }
    }

    pub async fn submit(&self, params: SubmitGoal) -> DomainResult<Goal> {
        let mut goal = Goal::new(params.title, params.description);
        goal.success_criteria = params.success_criteria;
        if let Some(priority) = params.priority {
            goal.priority = priority;
        }
        if let Some(source) = params.source {
            goal.source = source;
        }
        if let Some(metadata) = params.metadata {
            goal.metadata = metadata;
        }
        goal.repo = match params.repo {
            Some(repo) => Some(repo),
            None => self.repo_registry.default_repo_url().await?,
        };

        goal.validate().map_err(DomainError::ValidationFailed)?;
        self.repo.create(&goal).await?;
        self.bus.publish(EventPayload::GoalSubmitted { goal_id: goal.id });
        tracing::info!(goal_id = %goal.id, title = %goal.title, "Goal submitted");
        Ok(goal)
    }

    /// Validated transition; persists status and history in one write.
    pub async fn transition(
        &self,
        goal_id: Uuid,
        to: GoalStatus,
        reason: &str,
    ) -> DomainResult<Goal> {
        let mut goal = self
            .repo
            .get(goal_id)
            .await?
            .ok_or(DomainError::GoalNotFound(goal_id))?;
        let from = goal.status;

        goal.transition_to(to, reason)
            .map_err(|_| DomainError::InvalidStateTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })?;
        self.repo.update(&goal).await?;

        self.bus.publish(EventPayload::GoalStatusChanged {
            goal_id,
            from,
            to,
            reason: reason.to_string(),
        });
        tracing::info!(goal_id = %goal_id, from = from.as_str(), to = to.as_str(), reason, "Goal transitioned");
        Ok(goal)
    }

    /// Atomically select the highest-priority submitted goal and move it
    /// to `decomposing`. `None` when the backlog is drained.
    pub async fn dequeue(&self) -> DomainResult<Option<Goal>> {
        let Some(goal) = self.repo.next_submitted().await? else {
            return Ok(None);
        };
        let goal = self
            .transition(goal.id, GoalStatus::Decomposing, "dequeued by orchestrator")
            .await?;
        Ok(Some(goal))
    }

    pub async fn get(&self, goal_id: Uuid) -> DomainResult<Option<Goal>> {
        self.repo.get(goal_id).await
    }

    pub async fn list(&self) -> DomainResult<Vec<Goal>> {
        self.repo.list().await
    }

    /// Persist a field-level update (retry counters etc.) without a
    /// status transition.
    pub async fn update(&self, goal: &Goal) -> DomainResult<()> {
        self.repo.update(goal).await
    }

    pub async fn delete(&self, goal_id: Uuid) -> DomainResult<()> {
        self.repo.delete(goal_id).await?;
        self.bus.publish(EventPayload::GoalDeleted { goal_id });
        Ok(())
    }

    pub async fn stats(&self) -> DomainResult<BacklogStats> {
        let counts = self.repo.count_by_status().await?;
        let get = |status: GoalStatus| counts.get(&status).copied().unwrap_or(0);
        Ok(BacklogStats {
            submitted: get(GoalStatus::Submitted),
            active: get(GoalStatus::Decomposing)
                + get(GoalStatus::Executing)
                + get(GoalStatus::Verifying),
            complete: get(GoalStatus::Complete),
            failed: get(GoalStatus::Failed),
        })
    }
}
