//! Endpoint repository port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::Endpoint;

/// Repository interface for persisted LLM endpoints, keyed by `host:port`.
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// Insert or replace; registration is idempotent on the id.
    async fn upsert(&self, endpoint: &Endpoint) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<Endpoint>>;

    async fn delete(&self, id: &str) -> DomainResult<()>;

    async fn list(&self) -> DomainResult<Vec<Endpoint>>;
}
