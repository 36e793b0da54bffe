//! Pure complexity-tier routing.
//!
//! `route` maps a task plus an endpoint snapshot and configuration to a
//! [`RoutingDecision`]. It is side-effect-free and deterministic: identical
//! inputs produce identical decisions (`decided_at` excepted).
//!
//! Tier targets: trivial runs on the agent sidecar, standard runs on a
//! healthy local endpoint serving a standard model, complex goes to the
//! cloud. A missing target steps exactly one tier, never two.

use crate::domain::models::config::RoutingConfig;
use crate::domain::models::endpoint::EndpointSnapshot;
use crate::domain::models::routing::{CostTier, RoutingDecision, TargetType};
use crate::domain::models::task::{ComplexitySource, ComplexityTier, Task};

/// Multiplier applied when the candidate already has the model in VRAM.
const WARM_MODEL_BONUS: f64 = 1.15;
/// Multiplier applied when the host recently served the task's repo.
const REPO_AFFINITY_BONUS: f64 = 1.05;
/// VRAM capacity normalization reference.
const CAPACITY_REFERENCE_MB: f64 = 16_384.0;
/// Capacity factor ceiling.
const CAPACITY_FACTOR_CAP: f64 = 1.5;
/// Neutral CPU load assumed when a host reports no metrics.
const DEFAULT_LOAD_FACTOR: f64 = 0.5;
/// Neutral VRAM factor assumed when a host reports no metrics.
const DEFAULT_VRAM_FACTOR: f64 = 0.9;

/// Compute the routing decision for a task.
pub fn route(task: &Task, snapshot: &EndpointSnapshot, config: &RoutingConfig) -> RoutingDecision {
    let tier = task.complexity.effective_tier;
    let classification_reason = classification_reason(task);

    match tier {
        ComplexityTier::Trivial => sidecar_decision(tier, classification_reason, false, None, None),
        ComplexityTier::Standard => {
            let candidates = score_candidates(task, snapshot, config);
            if let Some(best) = best_candidate(&candidates) {
                return decision_for_ollama(
                    tier,
                    classification_reason,
                    best,
                    candidates.len(),
                    false,
                    None,
                    None,
                );
            }
            // One step toward the tier with capacity: the cloud backstop.
            if config.cloud_enabled {
                cloud_decision(
                    ComplexityTier::Complex,
                    classification_reason,
                    config,
                    true,
                    Some(ComplexityTier::Standard),
                    Some("no_healthy_ollama_endpoints".to_string()),
                )
            } else {
                RoutingDecision {
                    classification_reason,
                    ..RoutingDecision::unroutable(tier, "no_healthy_ollama_endpoints_cloud_disabled")
                }
            }
        }
        ComplexityTier::Complex => {
            if config.cloud_enabled {
                return cloud_decision(tier, classification_reason, config, false, None, None);
            }
            // Cloud disabled: step down one tier and try local endpoints.
            let candidates = score_candidates(task, snapshot, config);
            if let Some(best) = best_candidate(&candidates) {
                return decision_for_ollama(
                    ComplexityTier::Standard,
                    classification_reason,
                    best,
                    candidates.len(),
                    true,
                    Some(ComplexityTier::Complex),
                    Some("cloud_disabled".to_string()),
                );
            }
            RoutingDecision {
                classification_reason,
                ..RoutingDecision::unroutable(tier, "cloud_disabled_no_local_capacity")
            }
        }
    }
}

/// One scored (endpoint, model) pair.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    endpoint_id: String,
    model: String,
    score: f64,
}

fn score_candidates(
    task: &Task,
    snapshot: &EndpointSnapshot,
    config: &RoutingConfig,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for endpoint in snapshot.healthy() {
        let resources = snapshot.resources_for(&endpoint.id);

        let load_factor = resources.map_or(DEFAULT_LOAD_FACTOR, |r| (r.cpu / 100.0).clamp(0.0, 1.0));
        let vram_factor = resources
            .and_then(crate::domain::models::endpoint::ResourceReport::vram_load)
            .map_or(DEFAULT_VRAM_FACTOR, |load| (1.0 - load).clamp(0.05, 1.0));
        #[allow(clippy::cast_precision_loss)]
        let capacity_factor = resources
            .filter(|r| r.vram_total_mb > 0)
            .map_or(1.0, |r| (r.vram_total_mb as f64 / CAPACITY_REFERENCE_MB).min(CAPACITY_FACTOR_CAP));

        let host = endpoint.id.rsplit_once(':').map_or(endpoint.id.as_str(), |(h, _)| h);
        let repo_affinity = match (&task.repo, snapshot.recent_repos.get(host)) {
            (Some(repo), Some(recent)) if repo == recent => REPO_AFFINITY_BONUS,
            _ => 1.0,
        };

        for model in &config.standard_models {
            if !endpoint.serves_model(model) {
                continue;
            }
            let warm = resources
                .is_some_and(|r| r.loaded_models.iter().any(|m| m == model));
            let warm_bonus = if warm { WARM_MODEL_BONUS } else { 1.0 };

            let score = (1.0 - load_factor) * capacity_factor * vram_factor * warm_bonus * repo_affinity;
            candidates.push(Candidate {
                endpoint_id: endpoint.id.clone(),
                model: model.clone(),
                score,
            });
        }
    }

    candidates
}

/// Highest score wins; ties break on endpoint id then model name so the
/// router stays deterministic.
fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.endpoint_id.cmp(&b.endpoint_id))
            .then_with(|| a.model.cmp(&b.model))
    })
}

fn classification_reason(task: &Task) -> String {
    match task.complexity.source {
        ComplexitySource::Explicit => {
            format!("explicit:{}", task.complexity.effective_tier.as_str())
        }
        ComplexitySource::Inferred => match &task.complexity.inferred {
            Some(inferred) => format!(
                "inferred:{} (confidence {:.2}; {})",
                inferred.tier.as_str(),
                inferred.confidence,
                inferred.signals.join(",")
            ),
            None => format!("inferred:{}", task.complexity.effective_tier.as_str()),
        },
    }
}

fn sidecar_decision(
    tier: ComplexityTier,
    classification_reason: String,
    fallback_used: bool,
    fallback_from_tier: Option<ComplexityTier>,
    fallback_reason: Option<String>,
) -> RoutingDecision {
    RoutingDecision {
        effective_tier: tier,
        target_type: Some(TargetType::Sidecar),
        selected_endpoint: None,
        selected_model: None,
        fallback_used,
        fallback_from_tier,
        fallback_reason,
        candidate_count: 0,
        classification_reason,
        estimated_cost_tier: Some(CostTier::Free),
        decided_at: chrono::Utc::now(),
    }
}

fn cloud_decision(
    tier: ComplexityTier,
    classification_reason: String,
    config: &RoutingConfig,
    fallback_used: bool,
    fallback_from_tier: Option<ComplexityTier>,
    fallback_reason: Option<String>,
) -> RoutingDecision {
    RoutingDecision {
        effective_tier: tier,
        target_type: Some(TargetType::Claude),
        selected_endpoint: None,
        selected_model: Some(config.cloud_model.clone()),
        fallback_used,
        fallback_from_tier,
        fallback_reason,
        candidate_count: 0,
        classification_reason,
        estimated_cost_tier: Some(CostTier::Api),
        decided_at: chrono::Utc::now(),
    }
}

#[allow(clippy::too_many_arguments)]
fn decision_for_ollama(
    tier: ComplexityTier,
    classification_reason: String,
    best: &Candidate,
    candidate_count: usize,
    fallback_used: bool,
    fallback_from_tier: Option<ComplexityTier>,
    fallback_reason: Option<String>,
) -> RoutingDecision {
    RoutingDecision {
        effective_tier: tier,
        target_type: Some(TargetType::Ollama),
        selected_endpoint: Some(best.endpoint_id.clone()),
        selected_model: Some(best.model.clone()),
        fallback_used,
        fallback_from_tier,
        fallback_reason,
        candidate_count,
        classification_reason,
        estimated_cost_tier: Some(CostTier::Local),
        decided_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::endpoint::{Endpoint, ResourceReport};
    use crate::domain::models::Task;
    use chrono::Utc;
    use std::collections::HashMap;

    fn healthy_endpoint(id: &str, models: &[&str]) -> Endpoint {
        let mut ep = Endpoint::from_url(&format!("http://{id}")).unwrap();
        ep.record_probe_success(models.iter().map(|m| (*m).to_string()).collect());
        ep
    }

    fn report(host: &str, cpu: f64, vram_used: u64, vram_total: u64, loaded: &[&str]) -> ResourceReport {
        ResourceReport {
            host: host.to_string(),
            cpu,
            ram: 50.0,
            vram_used_mb: vram_used,
            vram_total_mb: vram_total,
            loaded_models: loaded.iter().map(|m| (*m).to_string()).collect(),
            reported_at: Utc::now(),
        }
    }

    fn config() -> RoutingConfig {
        RoutingConfig {
            standard_models: vec!["qwen2.5-coder:7b".to_string()],
            cloud_model: "claude-sonnet-4-5".to_string(),
            cloud_enabled: true,
        }
    }

    #[test]
    fn test_trivial_routes_to_sidecar() {
        let task = Task::new("t").with_complexity(ComplexityTier::Trivial);
        let decision = route(&task, &EndpointSnapshot::default(), &config());
        assert_eq!(decision.target_type, Some(TargetType::Sidecar));
        assert_eq!(decision.estimated_cost_tier, Some(CostTier::Free));
        assert!(!decision.fallback_used);
    }

    #[test]
    fn test_complex_routes_to_cloud() {
        let task = Task::new("t").with_complexity(ComplexityTier::Complex);
        let decision = route(&task, &EndpointSnapshot::default(), &config());
        assert_eq!(decision.target_type, Some(TargetType::Claude));
        assert_eq!(decision.selected_model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(decision.estimated_cost_tier, Some(CostTier::Api));
    }

    #[test]
    fn test_standard_with_no_endpoints_falls_back_to_cloud() {
        let task = Task::new("short fix").with_complexity(ComplexityTier::Standard);
        let decision = route(&task, &EndpointSnapshot::default(), &config());

        assert_eq!(decision.target_type, Some(TargetType::Claude));
        assert!(decision.fallback_used);
        assert_eq!(decision.fallback_from_tier, Some(ComplexityTier::Standard));
        assert_eq!(decision.fallback_reason.as_deref(), Some("no_healthy_ollama_endpoints"));
        assert_eq!(decision.estimated_cost_tier, Some(CostTier::Api));
    }

    #[test]
    fn test_standard_unroutable_when_cloud_disabled() {
        let task = Task::new("t").with_complexity(ComplexityTier::Standard);
        let cfg = RoutingConfig { cloud_enabled: false, ..config() };
        let decision = route(&task, &EndpointSnapshot::default(), &cfg);
        assert_eq!(decision.target_type, None);
    }

    #[test]
    fn test_complex_steps_down_one_tier_when_cloud_disabled() {
        let task = Task::new("t").with_complexity(ComplexityTier::Complex);
        let cfg = RoutingConfig { cloud_enabled: false, ..config() };

        let snapshot = EndpointSnapshot {
            endpoints: vec![healthy_endpoint("gpu-1:11434", &["qwen2.5-coder:7b"])],
            ..Default::default()
        };
        let decision = route(&task, &snapshot, &cfg);
        assert_eq!(decision.target_type, Some(TargetType::Ollama));
        assert!(decision.fallback_used);
        assert_eq!(decision.fallback_from_tier, Some(ComplexityTier::Complex));

        // No local capacity either: unroutable, never a two-tier skip.
        let decision = route(&task, &EndpointSnapshot::default(), &cfg);
        assert_eq!(decision.target_type, None);
    }

    #[test]
    fn test_unhealthy_endpoints_are_not_candidates() {
        let task = Task::new("t").with_complexity(ComplexityTier::Standard);
        let mut ep = healthy_endpoint("gpu-1:11434", &["qwen2.5-coder:7b"]);
        ep.record_probe_failure();
        ep.record_probe_failure();

        let snapshot = EndpointSnapshot { endpoints: vec![ep], ..Default::default() };
        let decision = route(&task, &snapshot, &config());
        assert!(decision.fallback_used);
        assert_eq!(decision.target_type, Some(TargetType::Claude));
    }

    #[test]
    fn test_scoring_prefers_idle_host_with_warm_model() {
        let task = Task::new("t").with_complexity(ComplexityTier::Standard);
        let snapshot = EndpointSnapshot {
            endpoints: vec![
                healthy_endpoint("busy:11434", &["qwen2.5-coder:7b"]),
                healthy_endpoint("idle:11434", &["qwen2.5-coder:7b"]),
            ],
            resources: vec![
                report("busy", 90.0, 14_000, 16_384, &[]),
                report("idle", 10.0, 2_000, 16_384, &["qwen2.5-coder:7b"]),
            ],
            ..Default::default()
        };

        let decision = route(&task, &snapshot, &config());
        assert_eq!(decision.selected_endpoint.as_deref(), Some("idle:11434"));
        assert_eq!(decision.candidate_count, 2);
    }

    #[test]
    fn test_repo_affinity_breaks_even_match() {
        let task = Task::new("t")
            .with_complexity(ComplexityTier::Standard)
            .with_repo("https://r/a");

        let mut recent_repos = HashMap::new();
        recent_repos.insert("gpu-2".to_string(), "https://r/a".to_string());

        let snapshot = EndpointSnapshot {
            endpoints: vec![
                healthy_endpoint("gpu-1:11434", &["qwen2.5-coder:7b"]),
                healthy_endpoint("gpu-2:11434", &["qwen2.5-coder:7b"]),
            ],
            recent_repos,
            ..Default::default()
        };

        let decision = route(&task, &snapshot, &config());
        assert_eq!(decision.selected_endpoint.as_deref(), Some("gpu-2:11434"));
    }

    #[test]
    fn test_deterministic_tie_break() {
        let task = Task::new("t").with_complexity(ComplexityTier::Standard);
        let snapshot = EndpointSnapshot {
            endpoints: vec![
                healthy_endpoint("b:11434", &["qwen2.5-coder:7b"]),
                healthy_endpoint("a:11434", &["qwen2.5-coder:7b"]),
            ],
            ..Default::default()
        };

        // Identical scores: lexicographically smaller endpoint id wins.
        let first = route(&task, &snapshot, &config());
        let second = route(&task, &snapshot, &config());
        assert_eq!(first.selected_endpoint.as_deref(), Some("a:11434"));
        assert_eq!(first.selected_endpoint, second.selected_endpoint);
        assert_eq!(first.selected_model, second.selected_model);
    }

    #[test]
    fn test_capacity_factor_capped() {
        let task = Task::new("t").with_complexity(ComplexityTier::Standard);
        // A 48 GB card scores as 1.5x, not 3x: one whale host should not
        // absorb the entire fleet's work.
        let snapshot = EndpointSnapshot {
            endpoints: vec![
                healthy_endpoint("whale:11434", &["qwen2.5-coder:7b"]),
                healthy_endpoint("small:11434", &["qwen2.5-coder:7b"]),
            ],
            resources: vec![
                report("whale", 50.0, 0, 49_152, &[]),
                report("small", 10.0, 0, 16_384, &[]),
            ],
            ..Default::default()
        };

        let decision = route(&task, &snapshot, &config());
        // (1-0.1)*1.0 = 0.9 beats (1-0.5)*1.5 = 0.75.
        assert_eq!(decision.selected_endpoint.as_deref(), Some("small:11434"));
    }
}
