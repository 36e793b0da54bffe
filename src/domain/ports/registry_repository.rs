//! Repo registry and auth store ports.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::RepoList;

/// Storage for the ordered repo list.
///
/// The whole list lives under a single key, so a reorder is one atomic
/// write rather than a multi-row mutation vulnerable to crashes.
#[async_trait]
pub trait RepoRegistryStore: Send + Sync {
    async fn load(&self) -> DomainResult<RepoList>;

    async fn save(&self, list: &RepoList) -> DomainResult<()>;
}

/// Bearer-token to agent-id resolution.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Resolve a bearer token; `None` means the token is unknown.
    async fn resolve(&self, token: &str) -> DomainResult<Option<String>>;

    async fn insert(&self, token: &str, agent_id: &str) -> DomainResult<()>;

    async fn revoke(&self, token: &str) -> DomainResult<()>;
}
