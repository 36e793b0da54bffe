//! Typed configuration tree.
//!
//! Every timing knob in the core is configurable so integration tests can
//! run the same code paths with millisecond values. Defaults match the
//! production intervals.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub agents: AgentsConfig,
    pub prober: ProberConfig,
    pub routing: RoutingConfig,
    pub hub: HubConfig,
    pub llm: LlmConfig,
    pub budget: BudgetConfig,
    pub rate_limit: RateLimitConfig,
    /// Root directory for repo checkouts.
    pub workspace_root: String,
    /// Bootstrap default repo, consulted only while the repo registry is empty.
    pub default_repo: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            agents: AgentsConfig::default(),
            prober: ProberConfig::default(),
            routing: RoutingConfig::default(),
            hub: HubConfig::default(),
            llm: LlmConfig::default(),
            budget: BudgetConfig::default(),
            rate_limit: RateLimitConfig::default(),
            workspace_root: ".agentcom/workspaces".to_string(),
            default_repo: None,
        }
    }
}

/// HTTP/WebSocket listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 4000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: ".agentcom/agentcom.db".to_string(), max_connections: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "json".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Periodic sweep interval.
    pub sweep_interval_ms: u64,
    /// Assigned/in-progress tasks idle longer than this are reclaimed.
    pub stuck_threshold_ms: u64,
    /// Queued tasks older than this are dead-lettered with `ttl_expired`.
    pub task_ttl_ms: u64,
    /// Grace period before the router's tier fallback is applied, to
    /// absorb transient endpoint outages.
    pub fallback_wait_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            stuck_threshold_ms: 300_000,
            task_ttl_ms: 600_000,
            fallback_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// How long a pushed task may sit unaccepted.
    pub acceptance_timeout_ms: u64,
    /// Expected gap between progress updates while working.
    pub progress_watchdog_ms: u64,
    /// Server ping cadence.
    pub ping_interval_ms: u64,
    /// Grace after a missed pong before the connection is closed.
    pub pong_grace_ms: u64,
    /// Presence reaper cadence.
    pub reaper_interval_ms: u64,
    /// Heartbeat age past which an agent is evicted.
    pub eviction_threshold_ms: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            acceptance_timeout_ms: 60_000,
            progress_watchdog_ms: 300_000,
            ping_interval_ms: 30_000,
            pong_grace_ms: 10_000,
            reaper_interval_ms: 30_000,
            eviction_threshold_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Max concurrent probes; slow endpoints cannot block the sweep.
    pub concurrency: usize,
    /// Resource reports older than this are swept from the metrics table.
    pub resource_ttl_ms: u64,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 5_000,
            concurrency: 4,
            resource_ttl_ms: 90_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Models eligible for standard-tier work.
    pub standard_models: Vec<String>,
    /// Cloud model used for the complex tier and the reliability backstop.
    pub cloud_model: String,
    /// When false, an unroutable task stays queued instead of going to cloud.
    pub cloud_enabled: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            standard_models: vec![
                "qwen2.5-coder:14b".to_string(),
                "qwen2.5-coder:7b".to_string(),
                "llama3.1:8b".to_string(),
            ],
            cloud_model: "claude-sonnet-4-5".to_string(),
            cloud_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub tick_interval_ms: u64,
    /// Forced return to resting when a state overstays.
    pub watchdog_ms: u64,
    /// Minimum gap between healing entries.
    pub healing_cooldown_ms: u64,
    /// Healing entries allowed inside the rolling window.
    pub healing_max_attempts: u32,
    /// Rolling window for the healing attempt count.
    pub healing_window_ms: u64,
    /// Resting idle time before the improvement cycle starts.
    pub idle_before_improving_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            watchdog_ms: 7_200_000,
            healing_cooldown_ms: 300_000,
            healing_max_attempts: 3,
            healing_window_ms: 3_600_000,
            idle_before_improving_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            timeout_ms: 120_000,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Token spend allowed per window; 0 disables the gate.
    pub max_tokens_per_window: u64,
    pub window_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { max_tokens_per_window: 2_000_000, window_ms: 86_400_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_second: 10, burst_size: 20 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec_intervals() {
        let config = Config::default();
        assert_eq!(config.scheduler.sweep_interval_ms, 30_000);
        assert_eq!(config.scheduler.stuck_threshold_ms, 300_000);
        assert_eq!(config.scheduler.task_ttl_ms, 600_000);
        assert_eq!(config.scheduler.fallback_wait_ms, 5_000);
        assert_eq!(config.agents.acceptance_timeout_ms, 60_000);
        assert_eq!(config.agents.ping_interval_ms, 30_000);
        assert_eq!(config.hub.tick_interval_ms, 1_000);
        assert_eq!(config.hub.watchdog_ms, 7_200_000);
        assert_eq!(config.hub.healing_cooldown_ms, 300_000);
        assert_eq!(config.llm.timeout_ms, 120_000);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r"
server:
  port: 8080
scheduler:
  task_ttl_ms: 1000
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.scheduler.task_ttl_ms, 1000);
        assert_eq!(config.scheduler.sweep_interval_ms, 30_000);
    }
}
