//! Routing decision records.
//!
//! The Task Router produces a [`RoutingDecision`] for every assignment.
//! The decision is opaque data to the scheduler and the WebSocket session:
//! it is persisted on the task and pushed to the agent unchanged, so the
//! agent invokes the correct backend without the hub holding any backend
//! behavior itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::ComplexityTier;

/// Which execution backend a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// Run directly on the agent sidecar, no model involved.
    Sidecar,
    /// Run against a local Ollama endpoint.
    Ollama,
    /// Run against the cloud Claude API.
    Claude,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sidecar => "sidecar",
            Self::Ollama => "ollama",
            Self::Claude => "claude",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sidecar" => Some(Self::Sidecar),
            "ollama" => Some(Self::Ollama),
            "claude" => Some(Self::Claude),
            _ => None,
        }
    }
}

/// Rough cost bucket of an execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    /// No model invocation at all.
    Free,
    /// Local inference, electricity only.
    Local,
    /// Metered cloud API.
    Api,
}

impl CostTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Local => "local",
            Self::Api => "api",
        }
    }

    /// The cost bucket a target type lands in.
    pub fn for_target(target: TargetType) -> Self {
        match target {
            TargetType::Sidecar => Self::Free,
            TargetType::Ollama => Self::Local,
            TargetType::Claude => Self::Api,
        }
    }
}

/// The record attached to a task at assignment capturing which backend and
/// endpoint were chosen and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Tier the routing actually used (after any fallback step).
    pub effective_tier: ComplexityTier,
    /// Chosen backend, or `None` when no target exists and cloud is disabled.
    pub target_type: Option<TargetType>,
    /// Endpoint id (`host:port`) for ollama targets.
    pub selected_endpoint: Option<String>,
    /// Model name for model-backed targets.
    pub selected_model: Option<String>,
    /// Whether a one-step tier fallback was applied.
    pub fallback_used: bool,
    /// The tier we fell back from, when `fallback_used`.
    pub fallback_from_tier: Option<ComplexityTier>,
    /// Machine-readable fallback cause (e.g. `no_healthy_ollama_endpoints`).
    pub fallback_reason: Option<String>,
    /// How many endpoints were scored for this decision.
    pub candidate_count: usize,
    /// Why the tier was what it was (explicit vs inferred, signals).
    pub classification_reason: String,
    /// Rough cost bucket of the chosen target.
    pub estimated_cost_tier: Option<CostTier>,
    /// When the decision was computed.
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// A decision that leaves the task queued: no target available.
    pub fn unroutable(tier: ComplexityTier, reason: impl Into<String>) -> Self {
        Self {
            effective_tier: tier,
            target_type: None,
            selected_endpoint: None,
            selected_model: None,
            fallback_used: false,
            fallback_from_tier: None,
            fallback_reason: Some(reason.into()),
            candidate_count: 0,
            classification_reason: String::new(),
            estimated_cost_tier: None,
            decided_at: Utc::now(),
        }
    }

    /// Whether this decision names a backend the scheduler can dispatch to.
    pub fn is_dispatchable(&self) -> bool {
        self.target_type.is_some()
    }
}
