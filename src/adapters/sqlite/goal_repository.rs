//! SQLite implementation of the GoalRepository.
//!
//! The status column and the history blob are written together, so the
//! persisted history is always a valid lifecycle path for the persisted
//! status.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Goal, GoalPriority, GoalSource, GoalStatus, GoalTransition};
use crate::domain::ports::GoalRepository;

#[derive(Clone)]
pub struct SqliteGoalRepository {
    pool: SqlitePool,
}

impl SqliteGoalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GoalRepository for SqliteGoalRepository {
    async fn create(&self, goal: &Goal) -> DomainResult<()> {
        let success_criteria = serde_json::to_string(&goal.success_criteria)?;
        let history = serde_json::to_string(&goal.history)?;
        let metadata = serde_json::to_string(&goal.metadata)?;

        sqlx::query(
            r#"INSERT INTO goals (id, title, description, success_criteria, priority,
               priority_rank, source, repo, metadata, status, history,
               verification_retries, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(goal.id.to_string())
        .bind(&goal.title)
        .bind(&goal.description)
        .bind(&success_criteria)
        .bind(goal.priority.as_str())
        .bind(goal.priority as i64)
        .bind(goal.source.as_str())
        .bind(&goal.repo)
        .bind(&metadata)
        .bind(goal.status.as_str())
        .bind(&history)
        .bind(i64::from(goal.verification_retries))
        .bind(goal.created_at.to_rfc3339())
        .bind(goal.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Goal>> {
        let row: Option<GoalRow> = sqlx::query_as("SELECT * FROM goals WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Goal::try_from).transpose()
    }

    async fn update(&self, goal: &Goal) -> DomainResult<()> {
        let success_criteria = serde_json::to_string(&goal.success_criteria)?;
        let history = serde_json::to_string(&goal.history)?;
        let metadata = serde_json::to_string(&goal.metadata)?;

        let updated = sqlx::query(
            r#"UPDATE goals SET title = ?, description = ?, success_criteria = ?,
               priority = ?, priority_rank = ?, source = ?, repo = ?, metadata = ?,
               status = ?, history = ?, verification_retries = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&goal.title)
        .bind(&goal.description)
        .bind(&success_criteria)
        .bind(goal.priority.as_str())
        .bind(goal.priority as i64)
        .bind(goal.source.as_str())
        .bind(&goal.repo)
        .bind(&metadata)
        .bind(goal.status.as_str())
        .bind(&history)
        .bind(i64::from(goal.verification_retries))
        .bind(goal.updated_at.to_rfc3339())
        .bind(goal.id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DomainError::GoalNotFound(goal.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> DomainResult<()> {
        let deleted = sqlx::query("DELETE FROM goals WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(DomainError::GoalNotFound(id));
        }
        Ok(())
    }

    async fn list(&self) -> DomainResult<Vec<Goal>> {
        let rows: Vec<GoalRow> = sqlx::query_as("SELECT * FROM goals ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Goal::try_from).collect()
    }

    async fn list_by_status(&self, status: GoalStatus) -> DomainResult<Vec<Goal>> {
        let rows: Vec<GoalRow> =
            sqlx::query_as("SELECT * FROM goals WHERE status = ? ORDER BY created_at DESC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Goal::try_from).collect()
    }

    async fn next_submitted(&self) -> DomainResult<Option<Goal>> {
        let row: Option<GoalRow> = sqlx::query_as(
            r#"SELECT * FROM goals WHERE status = 'submitted'
               ORDER BY priority_rank DESC, created_at ASC
               LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(Goal::try_from).transpose()
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<GoalStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM goals GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status_str, count) in rows {
            if let Some(status) = GoalStatus::from_str(&status_str) {
                #[allow(clippy::cast_sign_loss)]
                counts.insert(status, count as u64);
            }
        }
        Ok(counts)
    }
}

#[derive(sqlx::FromRow)]
struct GoalRow {
    id: String,
    title: String,
    description: String,
    success_criteria: String,
    priority: String,
    #[allow(dead_code)]
    priority_rank: i64,
    source: String,
    repo: Option<String>,
    metadata: Option<String>,
    status: String,
    history: String,
    verification_retries: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<GoalRow> for Goal {
    type Error = DomainError;

    fn try_from(row: GoalRow) -> Result<Self, Self::Error> {
        let id = super::parse_uuid(&row.id)?;
        let status = GoalStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        let priority = GoalPriority::from_str(&row.priority)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid priority: {}", row.priority)))?;
        let source = GoalSource::from_str(&row.source)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid source: {}", row.source)))?;

        let success_criteria: Vec<String> = serde_json::from_str(&row.success_criteria)?;
        let history: Vec<GoalTransition> = serde_json::from_str(&row.history)?;
        let metadata: serde_json::Value = match row.metadata {
            Some(json) => serde_json::from_str(&json)?,
            None => serde_json::Value::Null,
        };

        Ok(Goal {
            id,
            title: row.title,
            description: row.description,
            success_criteria,
            priority,
            source,
            repo: row.repo,
            metadata,
            status,
            history,
            #[allow(clippy::cast_sign_loss)]
            verification_retries: row.verification_retries as u32,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}
