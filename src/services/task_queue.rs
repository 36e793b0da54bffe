//! Task queue service.
//!
//! Single writer for all task state. Wraps the repository's atomic
//! primitives with submission-time resolution (default repo, inferred
//! complexity), generation-fence handling, and event publication.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Complexity, ComplexityTier, FileHint, RoutingDecision, Task, TaskPriority, TaskStatus,
    TaskWarning, VerificationStep,
};
use crate::domain::ports::{FailOutcome, GoalProgress, TaskFilter, TaskRepository};
use crate::services::complexity;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::repo_registry::RepoRegistry;

/// Submission parameters. Everything optional has a resolution rule.
#[derive(Debug, Clone, Default)]
pub struct SubmitTask {
    pub description: String,
    pub goal_id: Option<Uuid>,
    pub depends_on: Vec<Uuid>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub file_hints: Vec<FileHint>,
    pub success_criteria: Vec<String>,
    pub verification_steps: Vec<VerificationStep>,
    pub required_capabilities: Vec<String>,
    pub priority: Option<TaskPriority>,
    pub complexity_tier: Option<ComplexityTier>,
    pub max_retries: Option<u32>,
}

pub struct TaskQueue {
    repo: Arc<dyn TaskRepository>,
    bus: Arc<EventBus>,
    repo_registry: Arc<RepoRegistry>,
}

impl TaskQueue {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        bus: Arc<EventBus>,
        repo_registry: Arc<RepoRegistry>,
    ) -> Self {
        Self { repo, bus, repo_registry }
    }

    /// Submit a new task.
    ///
    /// Resolves the repo from the registry's top active entry when omitted
    /// and runs the complexity classifier when no explicit tier was given.
    pub async fn submit(&self, params: SubmitTask) -> DomainResult<(Task, Vec<TaskWarning>)> {
        let mut task = Task::new(params.description);
        task.goal_id = params.goal_id;
        task.branch = params.branch;
        task.file_hints = params.file_hints;
        task.success_criteria = params.success_criteria;
        task.verification_steps = params.verification_steps;
        task.required_capabilities = params.required_capabilities;
        if let Some(priority) = params.priority {
            task.priority = priority;
        }
        if let Some(max_retries) = params.max_retries {
            task.max_retries = max_retries;
        }
        for dep in params.depends_on {
            task = task.with_dependency(dep);
        }

        task.repo = match params.repo {
            Some(repo) => Some(repo),
            None => self.repo_registry.default_repo_url().await?,
        };

        task.complexity = match params.complexity_tier {
            Some(tier) => Complexity::explicit(tier),
            None => Complexity::inferred(complexity::classify(
                &task.description,
                &task.file_hints,
                &task.verification_steps,
            )),
        };

        task.validate().map_err(DomainError::ValidationFailed)?;
        let warnings = task.warnings();
        for warning in &warnings {
            tracing::warn!(task_id = %task.id, code = %warning.code, "{}", warning.message);
        }

        self.repo.create(&task).await?;
        self.bus.publish(EventPayload::TaskSubmitted {
            task_id: task.id,
            goal_id: task.goal_id,
            priority: task.priority,
        });

        Ok((task, warnings))
    }

    /// Atomically assign a queued task to an agent.
    pub async fn assign(
        &self,
        task_id: Uuid,
        agent_id: &str,
        expected_generation: u64,
    ) -> DomainResult<Task> {
        match self.repo.assign_atomic(task_id, agent_id, expected_generation).await? {
            Some(task) => {
                self.bus.publish(EventPayload::TaskAssigned {
                    task_id,
                    agent_id: agent_id.to_string(),
                    generation: task.generation,
                });
                Ok(task)
            }
            None => {
                // Disambiguate for the caller: wrong state vs lost race.
                let current = self
                    .repo
                    .get(task_id)
                    .await?
                    .ok_or(DomainError::TaskNotFound(task_id))?;
                if current.status == TaskStatus::Queued {
                    Err(DomainError::StaleGeneration {
                        task_id,
                        expected: expected_generation,
                        found: current.generation,
                    })
                } else {
                    Err(DomainError::NotQueued(task_id))
                }
            }
        }
    }

    /// Agent accepted the push: assigned -> in_progress.
    pub async fn accept(&self, task_id: Uuid, generation: u64) -> DomainResult<Option<Task>> {
        self.repo.mark_in_progress(task_id, generation).await
    }

    /// Progress heartbeat from the agent; refreshes the stuck-sweep clock.
    pub async fn progress(&self, task_id: Uuid, generation: u64) -> DomainResult<bool> {
        self.repo.touch(task_id, generation).await
    }

    /// Completion report. Stale generations are dropped silently.
    pub async fn complete(
        &self,
        task_id: Uuid,
        generation: u64,
        result: Option<serde_json::Value>,
    ) -> DomainResult<Option<Task>> {
        match self.repo.complete_atomic(task_id, generation, result).await? {
            Some(task) => {
                self.bus.publish(EventPayload::TaskCompleted {
                    task_id,
                    goal_id: task.goal_id,
                });
                Ok(Some(task))
            }
            None => {
                tracing::debug!(task_id = %task_id, generation, "Dropping stale task_complete");
                Ok(None)
            }
        }
    }

    /// Failure report. Requeues or dead-letters; stale reports are dropped.
    pub async fn fail(
        &self,
        task_id: Uuid,
        generation: u64,
        reason: &str,
    ) -> DomainResult<Option<FailOutcome>> {
        match self.repo.fail_atomic(task_id, generation, reason).await? {
            Some(FailOutcome::Retried(task)) => {
                self.bus.publish(EventPayload::TaskFailed {
                    task_id,
                    goal_id: task.goal_id,
                    retry_count: task.retry_count,
                });
                Ok(Some(FailOutcome::Retried(task)))
            }
            Some(FailOutcome::DeadLettered(task)) => {
                self.bus.publish(EventPayload::TaskDeadLettered {
                    task_id,
                    goal_id: task.goal_id,
                    reason: reason.to_string(),
                });
                Ok(Some(FailOutcome::DeadLettered(task)))
            }
            None => {
                tracing::debug!(task_id = %task_id, generation, "Dropping stale task_failed");
                Ok(None)
            }
        }
    }

    /// Return a held task to the queue (sweep, disconnect, healing).
    pub async fn requeue(&self, task_id: Uuid, reason: &str) -> DomainResult<Option<Task>> {
        match self.repo.requeue(task_id, reason).await? {
            Some(task) => {
                self.bus.publish(EventPayload::TaskRequeued {
                    task_id,
                    reason: reason.to_string(),
                });
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Persist a routing decision computed by the scheduler.
    pub async fn record_routing_decision(
        &self,
        task_id: Uuid,
        decision: RoutingDecision,
    ) -> DomainResult<()> {
        let Some(mut task) = self.repo.get(task_id).await? else {
            return Err(DomainError::TaskNotFound(task_id));
        };
        task.routing_decision = Some(decision);
        self.repo.update(&task).await
    }

    pub async fn get(&self, task_id: Uuid) -> DomainResult<Option<Task>> {
        self.repo.get(task_id).await
    }

    pub async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        self.repo.list(filter).await
    }

    pub async fn queued_in_order(&self) -> DomainResult<Vec<Task>> {
        self.repo.list_queued_ordered().await
    }

    pub async fn tasks_for_goal(&self, goal_id: Uuid) -> DomainResult<Vec<Task>> {
        self.repo.tasks_for_goal(goal_id).await
    }

    pub async fn goal_progress(&self, goal_id: Uuid) -> DomainResult<GoalProgress> {
        self.repo.goal_progress(goal_id).await
    }

    /// Held tasks whose last update is older than the threshold.
    pub async fn stuck_tasks(&self, threshold: chrono::Duration) -> DomainResult<Vec<Task>> {
        self.repo.stuck_tasks(chrono::Utc::now() - threshold).await
    }

    /// Dead-letter queued tasks older than the TTL; publishes per task.
    pub async fn expire_queued(&self, ttl: chrono::Duration) -> DomainResult<Vec<Task>> {
        let expired = self.repo.expire_queued(chrono::Utc::now() - ttl).await?;
        for task in &expired {
            self.bus.publish(EventPayload::TaskDeadLettered {
                task_id: task.id,
                goal_id: task.goal_id,
                reason: "ttl_expired".to_string(),
            });
        }
        Ok(expired)
    }

    pub async fn dead_letters(&self) -> DomainResult<Vec<Task>> {
        self.repo.dead_letters().await
    }

    /// Admin: move a dead-lettered task back into the queue.
    pub async fn retry_dead_letter(&self, task_id: Uuid) -> DomainResult<Option<Task>> {
        match self.repo.retry_dead_letter(task_id).await? {
            Some(task) => {
                self.bus.publish(EventPayload::TaskSubmitted {
                    task_id: task.id,
                    goal_id: task.goal_id,
                    priority: task.priority,
                });
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    pub async fn count_by_status(
        &self,
    ) -> DomainResult<std::collections::HashMap<TaskStatus, u64>> {
        self.repo.count_by_status().await
    }
}
