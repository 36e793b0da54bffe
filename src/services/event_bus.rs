//! Process-wide publish/subscribe bus.
//!
//! A single broadcast channel with sequence numbering and topic tags.
//! Delivery is at-most-once and fire-and-forget: publishing never blocks
//! and a lagging subscriber loses old events rather than slowing anyone
//! down. Per-topic ordering follows the broadcast channel's FIFO.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::{EndpointHealth, GoalStatus, HubState, TaskPriority};

/// Topic a hub event belongs to. Subscribers filter on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Tasks,
    Goals,
    Agents,
    Endpoints,
    Hub,
    Alerts,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tasks => write!(f, "tasks"),
            Self::Goals => write!(f, "goals"),
            Self::Agents => write!(f, "agents"),
            Self::Endpoints => write!(f, "endpoints"),
            Self::Hub => write!(f, "hub"),
            Self::Alerts => write!(f, "alerts"),
        }
    }
}

/// Event payloads published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // Task lifecycle
    TaskSubmitted {
        task_id: Uuid,
        goal_id: Option<Uuid>,
        priority: TaskPriority,
    },
    TaskAssigned {
        task_id: Uuid,
        agent_id: String,
        generation: u64,
    },
    TaskCompleted {
        task_id: Uuid,
        goal_id: Option<Uuid>,
    },
    TaskFailed {
        task_id: Uuid,
        goal_id: Option<Uuid>,
        retry_count: u32,
    },
    TaskDeadLettered {
        task_id: Uuid,
        goal_id: Option<Uuid>,
        reason: String,
    },
    TaskRequeued {
        task_id: Uuid,
        reason: String,
    },

    // Goal lifecycle
    GoalSubmitted {
        goal_id: Uuid,
    },
    GoalStatusChanged {
        goal_id: Uuid,
        from: GoalStatus,
        to: GoalStatus,
        reason: String,
    },
    GoalDeleted {
        goal_id: Uuid,
    },

    // Agent lifecycle
    AgentConnected {
        agent_id: String,
    },
    AgentIdle {
        agent_id: String,
    },
    AgentDisconnected {
        agent_id: String,
        reason: String,
    },

    // Endpoint health
    EndpointHealthChanged {
        endpoint_id: String,
        health: EndpointHealth,
    },

    // Hub cycle
    HubStateChanged {
        from: HubState,
        to: HubState,
        reason: String,
    },
    WatchdogTimeout {
        state: HubState,
    },

    // Health alerts
    AlertRaised {
        rule: String,
        message: String,
        critical: bool,
    },
}

impl EventPayload {
    /// The topic this payload is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::TaskSubmitted { .. }
            | Self::TaskAssigned { .. }
            | Self::TaskCompleted { .. }
            | Self::TaskFailed { .. }
            | Self::TaskDeadLettered { .. }
            | Self::TaskRequeued { .. } => Topic::Tasks,
            Self::GoalSubmitted { .. }
            | Self::GoalStatusChanged { .. }
            | Self::GoalDeleted { .. } => Topic::Goals,
            Self::AgentConnected { .. }
            | Self::AgentIdle { .. }
            | Self::AgentDisconnected { .. } => Topic::Agents,
            Self::EndpointHealthChanged { .. } => Topic::Endpoints,
            Self::HubStateChanged { .. } | Self::WatchdogTimeout { .. } => Topic::Hub,
            Self::AlertRaised { .. } => Topic::Alerts,
        }
    }
}

/// Event envelope with bus-assigned metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub topic: Topic,
    pub payload: EventPayload,
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast buffer size; lagging subscribers past this lose events.
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// The process-wide bus.
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.capacity);
        Self { sender, sequence: AtomicU64::new(0) }
    }

    /// Publish an event. Fire-and-forget: no subscribers is not an error.
    pub fn publish(&self, payload: EventPayload) -> HubEvent {
        let event = HubEvent {
            id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            topic: payload.topic(),
            payload,
        };
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event.clone());
        event
    }

    /// Subscribe to all topics. Filter on `event.topic` at the receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        let event = bus.publish(EventPayload::GoalSubmitted { goal_id: Uuid::new_v4() });
        assert_eq!(event.sequence, 1);
        assert_eq!(event.topic, Topic::Goals);
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        for _ in 0..3 {
            bus.publish(EventPayload::AgentConnected { agent_id: "a".to_string() });
        }

        let mut sequences = Vec::new();
        for _ in 0..3 {
            sequences.push(rx.recv().await.unwrap().sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_topic_tagging() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EventPayload::TaskSubmitted {
            task_id: Uuid::new_v4(),
            goal_id: None,
            priority: TaskPriority::Normal,
        });
        bus.publish(EventPayload::HubStateChanged {
            from: HubState::Resting,
            to: HubState::Executing,
            reason: "goals pending".to_string(),
        });

        assert_eq!(rx.recv().await.unwrap().topic, Topic::Tasks);
        assert_eq!(rx.recv().await.unwrap().topic, Topic::Hub);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_loses_old_events() {
        let bus = EventBus::new(EventBusConfig { capacity: 4 });
        let mut rx = bus.subscribe();

        for _ in 0..20 {
            bus.publish(EventPayload::AgentIdle { agent_id: "a".to_string() });
        }

        // At-most-once: the slow reader sees a lag error, not blocked senders.
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
