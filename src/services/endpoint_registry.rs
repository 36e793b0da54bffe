//! LLM endpoint registry and health prober.
//!
//! Owns the persisted endpoint table, the ephemeral resource-metrics
//! table, and the repo-affinity map. The prober sweeps every endpoint on
//! an interval inside a bounded-concurrency pool, so one slow endpoint
//! cannot stall the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

use crate::domain::errors::DomainResult;
use crate::domain::models::config::ProberConfig;
use crate::domain::models::endpoint::{Endpoint, EndpointSnapshot, ResourceReport};
use crate::domain::ports::EndpointRepository;
use crate::services::event_bus::{EventBus, EventPayload};

pub struct EndpointRegistry {
    repo: Arc<dyn EndpointRepository>,
    bus: Arc<EventBus>,
    config: ProberConfig,
    http_client: reqwest::Client,
    resources: RwLock<HashMap<String, ResourceReport>>,
    recent_repos: RwLock<HashMap<String, String>>,
}

impl EndpointRegistry {
    pub fn new(repo: Arc<dyn EndpointRepository>, bus: Arc<EventBus>, config: ProberConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            repo,
            bus,
            config,
            http_client,
            resources: RwLock::new(HashMap::new()),
            recent_repos: RwLock::new(HashMap::new()),
        }
    }

    /// Register an endpoint by URL. Idempotent on `host:port`: an existing
    /// entry keeps its health state.
    pub async fn register(&self, url: &str) -> DomainResult<Endpoint> {
        let endpoint = Endpoint::from_url(url)
            .map_err(crate::domain::errors::DomainError::ValidationFailed)?;

        if let Some(existing) = self.repo.get(&endpoint.id).await? {
            return Ok(existing);
        }
        self.repo.upsert(&endpoint).await?;
        tracing::info!(endpoint = %endpoint.id, "Endpoint registered");
        Ok(endpoint)
    }

    pub async fn remove(&self, id: &str) -> DomainResult<()> {
        self.repo.delete(id).await
    }

    pub async fn list(&self) -> DomainResult<Vec<Endpoint>> {
        self.repo.list().await
    }

    /// Record a sidecar resource report into the ephemeral table.
    pub async fn record_resources(&self, report: ResourceReport) {
        self.resources.write().await.insert(report.host.clone(), report);
    }

    /// Record that a host just served a repo; feeds routing affinity.
    pub async fn note_repo_served(&self, endpoint_id: &str, repo: &str) {
        let host = endpoint_id.rsplit_once(':').map_or(endpoint_id, |(h, _)| h);
        self.recent_repos.write().await.insert(host.to_string(), repo.to_string());
    }

    /// The combined read-model: endpoints, resources, model->host counts.
    pub async fn snapshot(&self) -> DomainResult<EndpointSnapshot> {
        let endpoints = self.repo.list().await?;
        let resources: Vec<ResourceReport> =
            self.resources.read().await.values().cloned().collect();
        let recent_repos = self.recent_repos.read().await.clone();

        let mut model_host_counts: HashMap<String, usize> = HashMap::new();
        for endpoint in &endpoints {
            for model in &endpoint.models {
                *model_host_counts.entry(model.clone()).or_insert(0) += 1;
            }
        }

        Ok(EndpointSnapshot { endpoints, resources, model_host_counts, recent_repos })
    }

    /// Drop resource entries older than the configured TTL.
    pub async fn sweep_resources(&self) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::milliseconds(
                i64::try_from(self.config.resource_ttl_ms).unwrap_or(i64::MAX),
            );
        self.resources.write().await.retain(|_, report| report.reported_at > cutoff);
    }

    /// One full probe pass over every registered endpoint.
    ///
    /// Probes run concurrently up to the configured cap. Health marks
    /// follow the two-failures-down, one-success-up rule; a mark change
    /// publishes `EndpointHealthChanged`.
    pub async fn probe_all(self: &Arc<Self>) -> DomainResult<()> {
        let endpoints = self.repo.list().await?;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        let probes = endpoints.into_iter().map(|endpoint| {
            let registry = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                registry.probe_one(endpoint).await;
            })
        });
        for result in futures::future::join_all(probes).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "Probe task panicked");
            }
        }

        self.sweep_resources().await;
        Ok(())
    }

    async fn probe_one(&self, mut endpoint: Endpoint) {
        let health_before = endpoint.health;

        match self.fetch_models(&endpoint.url).await {
            Ok(models) => endpoint.record_probe_success(models),
            Err(err) => {
                tracing::debug!(endpoint = %endpoint.id, error = %err, "Probe failed");
                endpoint.record_probe_failure();
            }
        }

        if endpoint.health != health_before {
            tracing::info!(
                endpoint = %endpoint.id,
                from = health_before.as_str(),
                to = endpoint.health.as_str(),
                "Endpoint health changed"
            );
            self.bus.publish(EventPayload::EndpointHealthChanged {
                endpoint_id: endpoint.id.clone(),
                health: endpoint.health,
            });
        }

        if let Err(err) = self.repo.upsert(&endpoint).await {
            tracing::error!(endpoint = %endpoint.id, error = %err, "Failed to persist probe result");
        }
    }

    /// Readiness check doubling as a model-inventory query.
    async fn fetch_models(&self, url: &str) -> Result<Vec<String>, reqwest::Error> {
        #[derive(serde::Deserialize)]
        struct TagsResponse {
            #[serde(default)]
            models: Vec<ModelEntry>,
        }
        #[derive(serde::Deserialize)]
        struct ModelEntry {
            name: String,
        }

        let response = self
            .http_client
            .get(format!("{}/api/tags", url.trim_end_matches('/')))
            .send()
            .await?
            .error_for_status()?;
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Run the periodic prober until the process shuts down.
    pub fn spawn_prober(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.probe_all().await {
                    tracing::error!(error = %err, "Endpoint probe sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteEndpointRepository};
    use crate::domain::models::endpoint::EndpointHealth;

    async fn setup(config: ProberConfig) -> Arc<EndpointRegistry> {
        let pool = create_migrated_test_pool().await.unwrap();
        Arc::new(EndpointRegistry::new(
            Arc::new(SqliteEndpointRepository::new(pool)),
            Arc::new(EventBus::default()),
            config,
        ))
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = setup(ProberConfig::default()).await;
        let first = registry.register("http://gpu-1:11434").await.unwrap();
        let second = registry.register("http://gpu-1:11434/").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_marks_unhealthy_after_two_failures() {
        // Nothing is listening on this URL, so every probe fails fast.
        let config = ProberConfig { timeout_ms: 100, ..ProberConfig::default() };
        let registry = setup(config).await;
        registry.register("http://127.0.0.1:1").await.unwrap();

        registry.probe_all().await.unwrap();
        let ep = &registry.list().await.unwrap()[0];
        assert_eq!(ep.consecutive_failures, 1);
        assert_ne!(ep.health, EndpointHealth::Unhealthy);

        registry.probe_all().await.unwrap();
        let ep = &registry.list().await.unwrap()[0];
        assert_eq!(ep.health, EndpointHealth::Unhealthy);
    }

    #[tokio::test]
    async fn test_probe_success_restores_and_refreshes_models() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[{"name":"qwen2.5-coder:7b"},{"name":"llama3.1:8b"}]}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let registry = setup(ProberConfig::default()).await;
        let endpoint = registry.register(&server.url()).await.unwrap();

        // Seed an unhealthy mark, then let one success restore it.
        let mut down = endpoint.clone();
        down.record_probe_failure();
        down.record_probe_failure();
        registry.repo.upsert(&down).await.unwrap();

        registry.probe_all().await.unwrap();
        let ep = &registry.list().await.unwrap()[0];
        assert_eq!(ep.health, EndpointHealth::Healthy);
        assert_eq!(ep.models.len(), 2);
    }

    #[tokio::test]
    async fn test_resource_sweep_drops_stale_entries() {
        let config = ProberConfig { resource_ttl_ms: 0, ..ProberConfig::default() };
        let registry = setup(config).await;

        registry
            .record_resources(ResourceReport {
                host: "gpu-1".to_string(),
                cpu: 10.0,
                ram: 10.0,
                vram_used_mb: 0,
                vram_total_mb: 16_384,
                loaded_models: vec![],
                reported_at: chrono::Utc::now() - chrono::Duration::seconds(1),
            })
            .await;

        registry.sweep_resources().await;
        let snapshot = registry.snapshot().await.unwrap();
        assert!(snapshot.resources.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_model_host_counts() {
        let registry = setup(ProberConfig::default()).await;
        for (id, models) in [("a:1", vec!["m1", "m2"]), ("b:1", vec!["m1"])] {
            let mut ep = Endpoint::from_url(&format!("http://{id}")).unwrap();
            ep.record_probe_success(models.into_iter().map(String::from).collect());
            registry.repo.upsert(&ep).await.unwrap();
        }

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.model_host_counts.get("m1"), Some(&2));
        assert_eq!(snapshot.model_host_counts.get("m2"), Some(&1));
    }

    #[tokio::test]
    async fn test_repo_affinity_tracking() {
        let registry = setup(ProberConfig::default()).await;
        registry.note_repo_served("gpu-1:11434", "https://r/a").await;
        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.recent_repos.get("gpu-1").map(String::as_str), Some("https://r/a"));
    }
}
