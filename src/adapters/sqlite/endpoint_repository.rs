//! SQLite implementation of the EndpointRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Endpoint, EndpointHealth};
use crate::domain::ports::EndpointRepository;

#[derive(Clone)]
pub struct SqliteEndpointRepository {
    pool: SqlitePool,
}

impl SqliteEndpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EndpointRepository for SqliteEndpointRepository {
    async fn upsert(&self, endpoint: &Endpoint) -> DomainResult<()> {
        let models = serde_json::to_string(&endpoint.models)?;

        sqlx::query(
            r#"INSERT INTO endpoints (id, url, models, health, consecutive_failures,
               last_probe_at, registered_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   url = excluded.url,
                   models = excluded.models,
                   health = excluded.health,
                   consecutive_failures = excluded.consecutive_failures,
                   last_probe_at = excluded.last_probe_at"#,
        )
        .bind(&endpoint.id)
        .bind(&endpoint.url)
        .bind(&models)
        .bind(endpoint.health.as_str())
        .bind(i64::from(endpoint.consecutive_failures))
        .bind(endpoint.last_probe_at.map(|t| t.to_rfc3339()))
        .bind(endpoint.registered_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<Endpoint>> {
        let row: Option<EndpointRow> = sqlx::query_as("SELECT * FROM endpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Endpoint::try_from).transpose()
    }

    async fn delete(&self, id: &str) -> DomainResult<()> {
        let deleted = sqlx::query("DELETE FROM endpoints WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(DomainError::EndpointNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> DomainResult<Vec<Endpoint>> {
        let rows: Vec<EndpointRow> =
            sqlx::query_as("SELECT * FROM endpoints ORDER BY registered_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Endpoint::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct EndpointRow {
    id: String,
    url: String,
    models: String,
    health: String,
    consecutive_failures: i64,
    last_probe_at: Option<String>,
    registered_at: String,
}

impl TryFrom<EndpointRow> for Endpoint {
    type Error = DomainError;

    fn try_from(row: EndpointRow) -> Result<Self, Self::Error> {
        let health = EndpointHealth::from_str(&row.health)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid health: {}", row.health)))?;
        let models: Vec<String> = serde_json::from_str(&row.models)?;

        Ok(Endpoint {
            id: row.id,
            url: row.url,
            models,
            health,
            #[allow(clippy::cast_sign_loss)]
            consecutive_failures: row.consecutive_failures as u32,
            last_probe_at: super::parse_optional_datetime(row.last_probe_at)?,
            registered_at: super::parse_datetime(&row.registered_at)?,
        })
    }
}
