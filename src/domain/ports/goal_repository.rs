//! Goal repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Goal, GoalStatus};

/// Repository interface for goal persistence.
///
/// `update` persists the status column and the history blob in one write so
/// the recorded history is always a valid lifecycle path.
#[async_trait]
pub trait GoalRepository: Send + Sync {
    async fn create(&self, goal: &Goal) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Goal>>;

    async fn update(&self, goal: &Goal) -> DomainResult<()>;

    async fn delete(&self, id: Uuid) -> DomainResult<()>;

    async fn list(&self) -> DomainResult<Vec<Goal>>;

    async fn list_by_status(&self, status: GoalStatus) -> DomainResult<Vec<Goal>>;

    /// The highest-priority, oldest goal still in `submitted`.
    async fn next_submitted(&self) -> DomainResult<Option<Goal>>;

    /// Count goals by status.
    async fn count_by_status(&self) -> DomainResult<std::collections::HashMap<GoalStatus, u64>>;
}
