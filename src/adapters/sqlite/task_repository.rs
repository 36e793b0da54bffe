//! SQLite implementation of the TaskRepository.
//!
//! Generation fencing is enforced here: every fenced operation is a
//! conditional UPDATE whose WHERE clause carries the expected generation
//! and status. A stale report affects zero rows and maps to `None`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Complexity, FileHint, RoutingDecision, Task, TaskPriority, TaskStatus, VerificationStep,
};
use crate::domain::ports::{FailOutcome, GoalProgress, TaskFilter, TaskRepository};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }
}

/// Insert a task row through any executor, so plain inserts and
/// transactional moves share one statement.
async fn insert_task(
    conn: &mut sqlx::SqliteConnection,
    task: &Task,
) -> DomainResult<()> {
    let depends_on = serde_json::to_string(&task.depends_on)?;
    let file_hints = serde_json::to_string(&task.file_hints)?;
    let success_criteria = serde_json::to_string(&task.success_criteria)?;
    let verification_steps = serde_json::to_string(&task.verification_steps)?;
    let required_capabilities = serde_json::to_string(&task.required_capabilities)?;
    let complexity = serde_json::to_string(&task.complexity)?;
    let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
    let routing = task.routing_decision.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"INSERT INTO tasks (id, goal_id, depends_on, description, repo, branch,
           file_hints, success_criteria, verification_steps, required_capabilities, complexity,
           priority, priority_rank, status, retry_count, max_retries, generation,
           assigned_to, assigned_at, created_at, updated_at, result, routing_decision)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(task.id.to_string())
    .bind(task.goal_id.map(|id| id.to_string()))
    .bind(&depends_on)
    .bind(&task.description)
    .bind(&task.repo)
    .bind(&task.branch)
    .bind(&file_hints)
    .bind(&success_criteria)
    .bind(&verification_steps)
    .bind(&required_capabilities)
    .bind(&complexity)
    .bind(task.priority.as_str())
    .bind(task.priority as i64)
    .bind(task.status.as_str())
    .bind(i64::from(task.retry_count))
    .bind(i64::from(task.max_retries))
    .bind(task.generation as i64)
    .bind(&task.assigned_to)
    .bind(task.assigned_at.map(|t| t.to_rfc3339()))
    .bind(task.created_at.to_rfc3339())
    .bind(task.updated_at.to_rfc3339())
    .bind(&result)
    .bind(&routing)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut *conn, task).await
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        self.fetch(id).await
    }

    async fn update(&self, task: &Task) -> DomainResult<()> {
        let depends_on = serde_json::to_string(&task.depends_on)?;
        let file_hints = serde_json::to_string(&task.file_hints)?;
        let success_criteria = serde_json::to_string(&task.success_criteria)?;
        let verification_steps = serde_json::to_string(&task.verification_steps)?;
        let required_capabilities = serde_json::to_string(&task.required_capabilities)?;
        let complexity = serde_json::to_string(&task.complexity)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let routing = task.routing_decision.as_ref().map(serde_json::to_string).transpose()?;

        let updated = sqlx::query(
            r#"UPDATE tasks SET goal_id = ?, depends_on = ?, description = ?, repo = ?,
               branch = ?, file_hints = ?, success_criteria = ?, verification_steps = ?,
               required_capabilities = ?, complexity = ?, priority = ?, priority_rank = ?,
               status = ?, retry_count = ?,
               max_retries = ?, generation = ?, assigned_to = ?, assigned_at = ?,
               updated_at = ?, result = ?, routing_decision = ?
               WHERE id = ?"#,
        )
        .bind(task.goal_id.map(|id| id.to_string()))
        .bind(&depends_on)
        .bind(&task.description)
        .bind(&task.repo)
        .bind(&task.branch)
        .bind(&file_hints)
        .bind(&success_criteria)
        .bind(&verification_steps)
        .bind(&required_capabilities)
        .bind(&complexity)
        .bind(task.priority.as_str())
        .bind(task.priority as i64)
        .bind(task.status.as_str())
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(task.generation as i64)
        .bind(&task.assigned_to)
        .bind(task.assigned_at.map(|t| t.to_rfc3339()))
        .bind(task.updated_at.to_rfc3339())
        .bind(&result)
        .bind(&routing)
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task.id));
        }
        Ok(())
    }

    async fn assign_atomic(
        &self,
        task_id: Uuid,
        agent_id: &str,
        expected_generation: u64,
    ) -> DomainResult<Option<Task>> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"UPDATE tasks
               SET status = 'assigned', assigned_to = ?, assigned_at = ?,
                   generation = generation + 1, updated_at = ?
               WHERE id = ? AND status = 'queued' AND generation = ?"#,
        )
        .bind(agent_id)
        .bind(&now)
        .bind(&now)
        .bind(task_id.to_string())
        .bind(expected_generation as i64)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch(task_id).await
    }

    async fn mark_in_progress(&self, task_id: Uuid, generation: u64) -> DomainResult<Option<Task>> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"UPDATE tasks SET status = 'in_progress', updated_at = ?
               WHERE id = ? AND status = 'assigned' AND generation = ?"#,
        )
        .bind(&now)
        .bind(task_id.to_string())
        .bind(generation as i64)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch(task_id).await
    }

    async fn touch(&self, task_id: Uuid, generation: u64) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"UPDATE tasks SET updated_at = ?
               WHERE id = ? AND generation = ? AND status IN ('assigned', 'in_progress')"#,
        )
        .bind(&now)
        .bind(task_id.to_string())
        .bind(generation as i64)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn complete_atomic(
        &self,
        task_id: Uuid,
        generation: u64,
        result: Option<serde_json::Value>,
    ) -> DomainResult<Option<Task>> {
        let now = Utc::now().to_rfc3339();
        let result_json = result.as_ref().map(serde_json::to_string).transpose()?;
        let updated = sqlx::query(
            r#"UPDATE tasks SET status = 'completed', result = ?, updated_at = ?
               WHERE id = ? AND generation = ? AND status IN ('assigned', 'in_progress')"#,
        )
        .bind(&result_json)
        .bind(&now)
        .bind(task_id.to_string())
        .bind(generation as i64)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch(task_id).await
    }

    async fn fail_atomic(
        &self,
        task_id: Uuid,
        generation: u64,
        reason: &str,
    ) -> DomainResult<Option<FailOutcome>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(
            r#"SELECT * FROM tasks
               WHERE id = ? AND generation = ? AND status IN ('assigned', 'in_progress')"#,
        )
        .bind(task_id.to_string())
        .bind(generation as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Stale or unknown: the assignment was already reclaimed.
            return Ok(None);
        };
        let mut task: Task = row.try_into()?;
        let now = Utc::now();

        if task.can_retry() {
            task.retry_count += 1;
            task.generation += 1;
            task.status = TaskStatus::Queued;
            task.assigned_to = None;
            task.assigned_at = None;
            task.updated_at = now;

            sqlx::query(
                r#"UPDATE tasks
                   SET status = 'queued', retry_count = ?, generation = ?,
                       assigned_to = NULL, assigned_at = NULL, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(i64::from(task.retry_count))
            .bind(task.generation as i64)
            .bind(now.to_rfc3339())
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::debug!(task_id = %task_id, retry = task.retry_count, reason, "Task requeued after failure");
            Ok(Some(FailOutcome::Retried(task)))
        } else {
            task.status = TaskStatus::DeadLettered;
            task.updated_at = now;
            let task_json = serde_json::to_string(&task)?;

            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(task_id.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO dead_letter_tasks (id, goal_id, task, reason, dead_lettered_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(task_id.to_string())
            .bind(task.goal_id.map(|id| id.to_string()))
            .bind(&task_json)
            .bind(reason)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::warn!(task_id = %task_id, reason, "Task dead-lettered");
            Ok(Some(FailOutcome::DeadLettered(task)))
        }
    }

    async fn requeue(&self, task_id: Uuid, reason: &str) -> DomainResult<Option<Task>> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"UPDATE tasks
               SET status = 'queued', generation = generation + 1,
                   assigned_to = NULL, assigned_at = NULL, updated_at = ?
               WHERE id = ? AND status IN ('assigned', 'in_progress')"#,
        )
        .bind(&now)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        tracing::debug!(task_id = %task_id, reason, "Task requeued");
        self.fetch(task_id).await
    }

    async fn list_queued_ordered(&self) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT * FROM tasks WHERE status = 'queued'
               ORDER BY priority_rank DESC, created_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(priority) = &filter.priority {
            query.push_str(" AND priority = ?");
            bindings.push(priority.as_str().to_string());
        }
        if let Some(goal_id) = &filter.goal_id {
            query.push_str(" AND goal_id = ?");
            bindings.push(goal_id.to_string());
        }
        if let Some(agent) = &filter.assigned_to {
            query.push_str(" AND assigned_to = ?");
            bindings.push(agent.clone());
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<TaskRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn tasks_for_goal(&self, goal_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE goal_id = ? ORDER BY created_at ASC")
                .bind(goal_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn goal_progress(&self, goal_id: Uuid) -> DomainResult<GoalProgress> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks WHERE goal_id = ? GROUP BY status")
                .bind(goal_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        let mut progress = GoalProgress::default();
        for (status, count) in rows {
            #[allow(clippy::cast_sign_loss)]
            let count = count as u64;
            match TaskStatus::from_str(&status) {
                Some(TaskStatus::Completed) => progress.completed += count,
                Some(TaskStatus::Failed | TaskStatus::DeadLettered) => progress.failed += count,
                Some(_) => progress.pending += count,
                None => {
                    return Err(DomainError::SerializationError(format!(
                        "Invalid status in tasks table: {status}"
                    )))
                }
            }
        }

        // Dead-lettered children leave the live table; count them as failed.
        let (dead,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_tasks WHERE goal_id = ?")
                .bind(goal_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        #[allow(clippy::cast_sign_loss)]
        {
            progress.failed += dead as u64;
        }

        Ok(progress)
    }

    async fn stuck_tasks(&self, older_than: DateTime<Utc>) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT * FROM tasks
               WHERE status IN ('assigned', 'in_progress') AND updated_at < ?"#,
        )
        .bind(older_than.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn expire_queued(&self, created_before: DateTime<Utc>) -> DomainResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE status = 'queued' AND created_at < ?")
                .bind(created_before.to_rfc3339())
                .fetch_all(&mut *tx)
                .await?;

        let now = Utc::now();
        let mut expired = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task: Task = row.try_into()?;
            task.status = TaskStatus::DeadLettered;
            task.updated_at = now;
            let task_json = serde_json::to_string(&task)?;

            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(task.id.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO dead_letter_tasks (id, goal_id, task, reason, dead_lettered_at)
                 VALUES (?, ?, ?, 'ttl_expired', ?)",
            )
            .bind(task.id.to_string())
            .bind(task.goal_id.map(|id| id.to_string()))
            .bind(&task_json)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            expired.push(task);
        }

        tx.commit().await?;
        Ok(expired)
    }

    async fn dead_letters(&self) -> DomainResult<Vec<Task>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT task FROM dead_letter_tasks ORDER BY dead_lettered_at DESC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(json,)| {
                serde_json::from_str(&json).map_err(|e| DomainError::SerializationError(e.to_string()))
            })
            .collect()
    }

    async fn retry_dead_letter(&self, task_id: Uuid) -> DomainResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT task FROM dead_letter_tasks WHERE id = ?")
                .bind(task_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let Some((json,)) = row else {
            return Ok(None);
        };
        let mut task: Task = serde_json::from_str(&json)
            .map_err(|e| DomainError::SerializationError(e.to_string()))?;

        task.status = TaskStatus::Queued;
        task.retry_count = 0;
        task.generation += 1;
        task.assigned_to = None;
        task.assigned_at = None;
        task.updated_at = Utc::now();

        sqlx::query("DELETE FROM dead_letter_tasks WHERE id = ?")
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
        insert_task(&mut *tx, &task).await?;
        tx.commit().await?;

        Ok(Some(task))
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status_str, count) in rows {
            if let Some(status) = TaskStatus::from_str(&status_str) {
                #[allow(clippy::cast_sign_loss)]
                counts.insert(status, count as u64);
            }
        }
        let (dead,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letter_tasks")
            .fetch_one(&self.pool)
            .await?;
        if dead > 0 {
            #[allow(clippy::cast_sign_loss)]
            counts.insert(TaskStatus::DeadLettered, dead as u64);
        }
        Ok(counts)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    goal_id: Option<String>,
    depends_on: String,
    description: String,
    repo: Option<String>,
    branch: Option<String>,
    file_hints: String,
    success_criteria: String,
    verification_steps: String,
    required_capabilities: String,
    complexity: String,
    priority: String,
    #[allow(dead_code)]
    priority_rank: i64,
    status: String,
    retry_count: i64,
    max_retries: i64,
    generation: i64,
    assigned_to: Option<String>,
    assigned_at: Option<String>,
    created_at: String,
    updated_at: String,
    result: Option<String>,
    routing_decision: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = super::parse_uuid(&row.id)?;
        let goal_id = super::parse_optional_uuid(row.goal_id)?;

        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        let priority = TaskPriority::from_str(&row.priority)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid priority: {}", row.priority)))?;

        let depends_on: Vec<Uuid> = serde_json::from_str(&row.depends_on)?;
        let file_hints: Vec<FileHint> = serde_json::from_str(&row.file_hints)?;
        let success_criteria: Vec<String> = serde_json::from_str(&row.success_criteria)?;
        let verification_steps: Vec<VerificationStep> =
            serde_json::from_str(&row.verification_steps)?;
        let required_capabilities: Vec<String> =
            serde_json::from_str(&row.required_capabilities)?;
        let complexity: Complexity = serde_json::from_str(&row.complexity)?;
        let result: Option<serde_json::Value> =
            row.result.as_deref().map(serde_json::from_str).transpose()?;
        let routing_decision: Option<RoutingDecision> =
            row.routing_decision.as_deref().map(serde_json::from_str).transpose()?;

        Ok(Task {
            id,
            goal_id,
            depends_on,
            description: row.description,
            repo: row.repo,
            branch: row.branch,
            file_hints,
            success_criteria,
            verification_steps,
            required_capabilities,
            complexity,
            priority,
            status,
            #[allow(clippy::cast_sign_loss)]
            retry_count: row.retry_count as u32,
            #[allow(clippy::cast_sign_loss)]
            max_retries: row.max_retries as u32,
            #[allow(clippy::cast_sign_loss)]
            generation: row.generation as u64,
            assigned_to: row.assigned_to,
            assigned_at: super::parse_optional_datetime(row.assigned_at)?,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
            result,
            routing_decision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn setup() -> SqliteTaskRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskRepository::new(pool)
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let repo = setup().await;
        let task = Task::new("Build the widget")
            .with_repo("https://r/a")
            .with_priority(TaskPriority::High);

        repo.create(&task).await.unwrap();
        let fetched = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn test_assign_atomic_success_and_fencing() {
        let repo = setup().await;
        let task = Task::new("t");
        repo.create(&task).await.unwrap();

        let assigned = repo.assign_atomic(task.id, "agent-1", 0).await.unwrap().unwrap();
        assert_eq!(assigned.status, TaskStatus::Assigned);
        assert_eq!(assigned.generation, 1);
        assert_eq!(assigned.assigned_to.as_deref(), Some("agent-1"));
        assert!(assigned.assigned_at.is_some());

        // Stale generation: no effect.
        let second = repo.assign_atomic(task.id, "agent-2", 0).await.unwrap();
        assert!(second.is_none());
        let current = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(current.assigned_to.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn test_stale_complete_is_noop() {
        let repo = setup().await;
        let task = Task::new("t");
        repo.create(&task).await.unwrap();
        repo.assign_atomic(task.id, "agent-1", 0).await.unwrap().unwrap();

        // Agent went silent; the sweep reclaims the task (generation 1 -> 2).
        repo.requeue(task.id, "stuck").await.unwrap().unwrap();
        repo.assign_atomic(task.id, "agent-2", 2).await.unwrap().unwrap();

        // The original agent reports with its old generation.
        let stale = repo.complete_atomic(task.id, 1, None).await.unwrap();
        assert!(stale.is_none());
        let current = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Assigned);

        // The new holder completes normally.
        let done = repo.complete_atomic(task.id, 3, Some(serde_json::json!({"ok": true})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_fail_requeues_until_retries_exhausted() {
        let repo = setup().await;
        let mut task = Task::new("t");
        task.max_retries = 1;
        repo.create(&task).await.unwrap();

        let assigned = repo.assign_atomic(task.id, "a", 0).await.unwrap().unwrap();
        match repo.fail_atomic(task.id, assigned.generation, "boom").await.unwrap().unwrap() {
            FailOutcome::Retried(t) => {
                assert_eq!(t.status, TaskStatus::Queued);
                assert_eq!(t.retry_count, 1);
                assert!(t.assigned_to.is_none());
            }
            FailOutcome::DeadLettered(_) => panic!("should have retried"),
        }

        let assigned = repo.assign_atomic(task.id, "a", 2).await.unwrap().unwrap();
        match repo.fail_atomic(task.id, assigned.generation, "boom again").await.unwrap().unwrap() {
            FailOutcome::DeadLettered(t) => assert_eq!(t.status, TaskStatus::DeadLettered),
            FailOutcome::Retried(_) => panic!("retries were exhausted"),
        }

        // Gone from the live table, present in the dead-letter table.
        assert!(repo.get(task.id).await.unwrap().is_none());
        let dead = repo.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, task.id);
    }

    #[tokio::test]
    async fn test_stale_fail_is_noop() {
        let repo = setup().await;
        let task = Task::new("t");
        repo.create(&task).await.unwrap();
        repo.assign_atomic(task.id, "a", 0).await.unwrap().unwrap();
        repo.requeue(task.id, "reclaim").await.unwrap().unwrap();

        let outcome = repo.fail_atomic(task.id, 1, "late failure").await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_queue_ordering_priority_then_age() {
        let repo = setup().await;
        let low = Task::new("low").with_priority(TaskPriority::Low);
        let urgent = Task::new("urgent").with_priority(TaskPriority::Urgent);
        let normal_old = Task::new("normal-old");
        let mut normal_new = Task::new("normal-new");
        normal_new.created_at = normal_old.created_at + chrono::Duration::seconds(5);

        for t in [&low, &urgent, &normal_old, &normal_new] {
            repo.create(t).await.unwrap();
        }

        let queued = repo.list_queued_ordered().await.unwrap();
        let descriptions: Vec<_> = queued.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descriptions, vec!["urgent", "normal-old", "normal-new", "low"]);
    }

    #[tokio::test]
    async fn test_goal_progress_counts_dead_letters_as_failed() {
        let repo = setup().await;
        let goal_id = Uuid::new_v4();

        let done = Task::new("done").with_goal(goal_id);
        repo.create(&done).await.unwrap();
        let g = repo.assign_atomic(done.id, "a", 0).await.unwrap().unwrap().generation;
        repo.complete_atomic(done.id, g, None).await.unwrap().unwrap();

        let mut doomed = Task::new("doomed").with_goal(goal_id);
        doomed.max_retries = 0;
        repo.create(&doomed).await.unwrap();
        let g = repo.assign_atomic(doomed.id, "a", 0).await.unwrap().unwrap().generation;
        repo.fail_atomic(doomed.id, g, "boom").await.unwrap().unwrap();

        let pending = Task::new("pending").with_goal(goal_id);
        repo.create(&pending).await.unwrap();

        let progress = repo.goal_progress(goal_id).await.unwrap();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.pending, 1);
    }

    #[tokio::test]
    async fn test_stuck_and_ttl_queries() {
        let repo = setup().await;
        let task = Task::new("held");
        repo.create(&task).await.unwrap();
        repo.assign_atomic(task.id, "a", 0).await.unwrap().unwrap();

        let future = Utc::now() + chrono::Duration::seconds(60);
        let stuck = repo.stuck_tasks(future).await.unwrap();
        assert_eq!(stuck.len(), 1);

        let queued = Task::new("stale-queued");
        repo.create(&queued).await.unwrap();
        let expired = repo.expire_queued(future).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, queued.id);
        assert!(repo.get(queued.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_dead_letter() {
        let repo = setup().await;
        let mut task = Task::new("t");
        task.max_retries = 0;
        repo.create(&task).await.unwrap();
        let g = repo.assign_atomic(task.id, "a", 0).await.unwrap().unwrap().generation;
        repo.fail_atomic(task.id, g, "boom").await.unwrap().unwrap();

        let revived = repo.retry_dead_letter(task.id).await.unwrap().unwrap();
        assert_eq!(revived.status, TaskStatus::Queued);
        assert_eq!(revived.retry_count, 0);
        assert!(repo.get(task.id).await.unwrap().is_some());
        assert!(repo.dead_letters().await.unwrap().is_empty());

        // Unknown ids are a clean miss.
        assert!(repo.retry_dead_letter(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_refreshes_updated_at() {
        let repo = setup().await;
        let task = Task::new("t");
        repo.create(&task).await.unwrap();
        let assigned = repo.assign_atomic(task.id, "a", 0).await.unwrap().unwrap();
        repo.mark_in_progress(task.id, assigned.generation).await.unwrap().unwrap();

        assert!(repo.touch(task.id, assigned.generation).await.unwrap());
        // Stale generation does not refresh.
        assert!(!repo.touch(task.id, 0).await.unwrap());
    }
}
