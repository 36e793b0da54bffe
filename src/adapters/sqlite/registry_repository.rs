//! SQLite implementations of the repo registry store and the auth store.
//!
//! The repo registry serializes the entire ordered list into one row, so
//! any reorder or pause is a single atomic write.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::errors::DomainResult;
use crate::domain::models::RepoList;
use crate::domain::ports::{AuthStore, RepoRegistryStore};

const REGISTRY_KEY: &str = "repo_registry";

#[derive(Clone)]
pub struct SqliteRepoRegistryStore {
    pool: SqlitePool,
}

impl SqliteRepoRegistryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepoRegistryStore for SqliteRepoRegistryStore {
    async fn load(&self) -> DomainResult<RepoList> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT entries FROM repo_registry WHERE key = ?")
                .bind(REGISTRY_KEY)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(RepoList::default()),
        }
    }

    async fn save(&self, list: &RepoList) -> DomainResult<()> {
        let json = serde_json::to_string(list)?;
        sqlx::query(
            r#"INSERT INTO repo_registry (key, entries) VALUES (?, ?)
               ON CONFLICT(key) DO UPDATE SET entries = excluded.entries"#,
        )
        .bind(REGISTRY_KEY)
        .bind(&json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteAuthStore {
    pool: SqlitePool,
}

impl SqliteAuthStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthStore for SqliteAuthStore {
    async fn resolve(&self, token: &str) -> DomainResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT agent_id FROM auth_tokens WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(agent_id,)| agent_id))
    }

    async fn insert(&self, token: &str, agent_id: &str) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO auth_tokens (token, agent_id, created_at) VALUES (?, ?, ?)
               ON CONFLICT(token) DO UPDATE SET agent_id = excluded.agent_id"#,
        )
        .bind(token)
        .bind(agent_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, token: &str) -> DomainResult<()> {
        sqlx::query("DELETE FROM auth_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::{RepoEntry, RepoStatus};

    #[tokio::test]
    async fn test_registry_round_trip() {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = SqliteRepoRegistryStore::new(pool);

        // Empty registry loads as an empty list.
        assert!(store.load().await.unwrap().entries.is_empty());

        let mut list = RepoList::default();
        list.add(RepoEntry::new("https://r/a"));
        list.add(RepoEntry::new("https://r/b"));
        store.save(&list).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, list);
    }

    #[tokio::test]
    async fn test_reorder_is_single_write() {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = SqliteRepoRegistryStore::new(pool);

        let mut list = RepoList::default();
        list.add(RepoEntry::new("https://r/a"));
        list.add(RepoEntry::new("https://r/b"));
        store.save(&list).await.unwrap();

        let b = list.entries[1].id.clone();
        list.move_up(&b);
        list.set_status(&b, RepoStatus::Paused);
        store.save(&list).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.entries[0].id, b);
        assert_eq!(loaded.entries[0].status, RepoStatus::Paused);
    }

    #[tokio::test]
    async fn test_auth_store() {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = SqliteAuthStore::new(pool);

        assert!(store.resolve("tok-1").await.unwrap().is_none());

        store.insert("tok-1", "agent-1").await.unwrap();
        assert_eq!(store.resolve("tok-1").await.unwrap().as_deref(), Some("agent-1"));

        store.revoke("tok-1").await.unwrap();
        assert!(store.resolve("tok-1").await.unwrap().is_none());
    }
}
