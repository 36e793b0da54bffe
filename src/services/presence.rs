//! Agent presence tracking.
//!
//! An in-memory heartbeat map updated on every inbound WebSocket frame.
//! The reaper (driven from the agent registry) asks for stale entries and
//! evicts them.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct Presence {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for an agent.
    pub async fn heartbeat(&self, agent_id: &str) {
        self.entries.write().await.insert(agent_id.to_string(), Utc::now());
    }

    pub async fn remove(&self, agent_id: &str) {
        self.entries.write().await.remove(agent_id);
    }

    pub async fn last_seen(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(agent_id).copied()
    }

    /// Agents whose last heartbeat is older than the threshold.
    pub async fn stale(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now() - threshold;
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, &seen)| seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn online_count(&self) -> usize {
        self.entries.read().await.len()
    }
}
