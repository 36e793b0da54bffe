//! Repo registry service.
//!
//! Owner of the ordered repo list. Mutations are serialized through one
//! lock and persisted as a single-row write, so every reorder or pause is
//! atomic on disk. Reads hand out cloned snapshots.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{RepoEntry, RepoList, RepoStatus};
use crate::domain::ports::RepoRegistryStore;

pub struct RepoRegistry {
    store: Arc<dyn RepoRegistryStore>,
    /// Serializes read-modify-write cycles on the single-row list.
    write_lock: Mutex<()>,
    /// Bootstrap default consulted only while the registry is empty.
    bootstrap_default: Option<String>,
}

impl RepoRegistry {
    pub fn new(store: Arc<dyn RepoRegistryStore>, bootstrap_default: Option<String>) -> Self {
        Self { store, write_lock: Mutex::new(()), bootstrap_default }
    }

    /// Current list snapshot.
    pub async fn snapshot(&self) -> DomainResult<RepoList> {
        self.store.load().await
    }

    /// The URL tasks and goals inherit when submitted without a repo.
    ///
    /// The registry wins whenever it has an active entry; the legacy config
    /// default is a bootstrap fallback only.
    pub async fn default_repo_url(&self) -> DomainResult<Option<String>> {
        let list = self.store.load().await?;
        if let Some(entry) = list.default_repo() {
            return Ok(Some(entry.url.clone()));
        }
        if list.entries.is_empty() {
            return Ok(self.bootstrap_default.clone());
        }
        // Registered but everything paused: no default.
        Ok(None)
    }

    pub async fn add(&self, url: &str) -> DomainResult<RepoEntry> {
        let _guard = self.write_lock.lock().await;
        let mut list = self.store.load().await?;
        let entry = RepoEntry::new(url);
        if !list.add(entry.clone()) {
            return Err(DomainError::ValidationFailed(format!(
                "Repo already registered: {url}"
            )));
        }
        self.store.save(&list).await?;
        tracing::info!(repo = %entry.id, "Repo registered");
        Ok(entry)
    }

    pub async fn remove(&self, id: &str) -> DomainResult<()> {
        self.mutate(id, |list, id| list.remove(id)).await
    }

    pub async fn move_up(&self, id: &str) -> DomainResult<()> {
        self.mutate(id, |list, id| list.move_up(id)).await
    }

    pub async fn move_down(&self, id: &str) -> DomainResult<()> {
        self.mutate(id, |list, id| list.move_down(id)).await
    }

    pub async fn pause(&self, id: &str) -> DomainResult<()> {
        self.mutate(id, |list, id| list.set_status(id, RepoStatus::Paused)).await
    }

    pub async fn unpause(&self, id: &str) -> DomainResult<()> {
        self.mutate(id, |list, id| list.set_status(id, RepoStatus::Active)).await
    }

    async fn mutate(
        &self,
        id: &str,
        op: impl FnOnce(&mut RepoList, &str) -> bool,
    ) -> DomainResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut list = self.store.load().await?;
        if !op(&mut list, id) {
            return Err(DomainError::RepoNotFound(id.to_string()));
        }
        self.store.save(&list).await
    }
}
