//! LLM endpoint domain model.
//!
//! An endpoint is one locally reachable inference server (Ollama-style).
//! The registry persists endpoints and a periodic prober maintains their
//! health marks: two consecutive probe failures mark an endpoint
//! unhealthy, the first success restores it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive probe failures required to mark an endpoint unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 2;

/// Probe-derived health of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointHealth {
    Healthy,
    Unhealthy,
    /// Never probed yet.
    Unknown,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self::Unknown
    }
}

impl EndpointHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// One registered inference endpoint, keyed by `host:port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// `host:port`, extracted from the URL. Registration is idempotent on it.
    pub id: String,
    pub url: String,
    /// Models the endpoint declared at its last successful probe.
    pub models: Vec<String>,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Endpoint {
    /// Build an endpoint from a URL; fails when no host can be extracted.
    pub fn from_url(url: impl Into<String>) -> Result<Self, String> {
        let url = url.into();
        let id = host_port_of(&url).ok_or_else(|| format!("Invalid endpoint URL: {url}"))?;
        Ok(Self {
            id,
            url,
            models: Vec::new(),
            health: EndpointHealth::Unknown,
            consecutive_failures: 0,
            last_probe_at: None,
            registered_at: Utc::now(),
        })
    }

    /// Record a successful probe: restores health and refreshes the model set.
    pub fn record_probe_success(&mut self, models: Vec<String>) {
        self.health = EndpointHealth::Healthy;
        self.consecutive_failures = 0;
        self.models = models;
        self.last_probe_at = Some(Utc::now());
    }

    /// Record a failed probe; flips to unhealthy at the failure threshold.
    pub fn record_probe_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            self.health = EndpointHealth::Unhealthy;
        }
        self.last_probe_at = Some(Utc::now());
    }

    pub fn is_healthy(&self) -> bool {
        self.health == EndpointHealth::Healthy
    }

    /// Whether a given model is in the declared set.
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// Extract `host:port` from a URL, defaulting the port by scheme.
pub fn host_port_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .map(|r| (r, 443u16))
        .or_else(|| url.strip_prefix("http://").map(|r| (r, 80u16)))?;
    let (rest, default_port) = rest;
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() && !host.is_empty() => {
            Some(format!("{host}:{port}"))
        }
        _ => Some(format!("{authority}:{default_port}")),
    }
}

/// Host resource sample reported by a sidecar. Ephemeral, in-memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub host: String,
    /// CPU utilization in percent.
    pub cpu: f64,
    /// RAM utilization in percent.
    pub ram: f64,
    pub vram_used_mb: u64,
    pub vram_total_mb: u64,
    /// Models currently resident in VRAM.
    pub loaded_models: Vec<String>,
    pub reported_at: DateTime<Utc>,
}

impl ResourceReport {
    /// Fraction of VRAM in use, or `None` when the total is unreported.
    pub fn vram_load(&self) -> Option<f64> {
        if self.vram_total_mb == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.vram_used_mb as f64 / self.vram_total_mb as f64)
    }
}

/// Combined read-model served to dashboards and the router in one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub endpoints: Vec<Endpoint>,
    pub resources: Vec<ResourceReport>,
    /// Fleet-level model name -> number of hosts serving it.
    pub model_host_counts: std::collections::HashMap<String, usize>,
    /// Host -> repo URL it most recently served; feeds repo affinity.
    #[serde(default)]
    pub recent_repos: std::collections::HashMap<String, String>,
}

impl EndpointSnapshot {
    /// Healthy endpoints only.
    pub fn healthy(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.is_healthy())
    }

    /// The resource report for a given endpoint id's host, if any.
    pub fn resources_for(&self, endpoint_id: &str) -> Option<&ResourceReport> {
        let host = endpoint_id.rsplit_once(':').map_or(endpoint_id, |(h, _)| h);
        self.resources.iter().find(|r| r.host == host)
    }
}
