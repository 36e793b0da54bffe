//! Agent registry and per-agent state machine.
//!
//! One entry per connected agent. The WebSocket session feeds protocol
//! messages in; the registry drives the idle/assigned/working machine,
//! owns the acceptance deadline, and forwards fenced reports into the
//! task queue. Outbound frames go through the session's channel sender;
//! dropping the sender is how an eviction tears the connection down.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::agent::{AgentIdentity, AgentSnapshot, AgentState, Assignment};
use crate::domain::models::config::AgentsConfig;
use crate::domain::models::protocol::ServerMessage;
use crate::domain::models::Task;
use crate::domain::ports::FailOutcome;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::presence::Presence;
use crate::services::task_queue::TaskQueue;

/// Window for the scheduler's least-recently-busy tie-break.
const COMPLETION_WINDOW_SECS: i64 = 60;

struct AgentEntry {
    identity: AgentIdentity,
    state: AgentState,
    assignment: Option<Assignment>,
    /// When a pushed task must be accepted by.
    acceptance_deadline: Option<DateTime<Utc>>,
    /// Last progress message while working.
    last_progress_at: Option<DateTime<Utc>>,
    /// Completion timestamps inside the recent window.
    completions: VecDeque<DateTime<Utc>>,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl AgentEntry {
    fn snapshot(&self, last_heartbeat_at: DateTime<Utc>) -> AgentSnapshot {
        let cutoff = Utc::now() - Duration::seconds(COMPLETION_WINDOW_SECS);
        AgentSnapshot {
            id: self.identity.id.clone(),
            state: self.state,
            capabilities: self.identity.capabilities.clone(),
            current_task_id: self.assignment.map(|a| a.task_id),
            current_generation: self.assignment.map(|a| a.generation),
            last_heartbeat_at,
            #[allow(clippy::cast_possible_truncation)]
            recently_completed: self.completions.iter().filter(|&&t| t > cutoff).count() as u32,
        }
    }
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    queue: Arc<TaskQueue>,
    presence: Arc<Presence>,
    bus: Arc<EventBus>,
    config: AgentsConfig,
}

impl AgentRegistry {
    pub fn new(
        queue: Arc<TaskQueue>,
        presence: Arc<Presence>,
        bus: Arc<EventBus>,
        config: AgentsConfig,
    ) -> Self {
        Self { agents: RwLock::new(HashMap::new()), queue, presence, bus, config }
    }

    /// Bind a freshly identified connection. A reconnect under the same id
    /// evicts the previous entry first (its task is requeued).
    pub async fn connect(
        &self,
        identity: AgentIdentity,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> DomainResult<()> {
        let agent_id = identity.id.clone();
        self.disconnect(&agent_id, "replaced_by_reconnect").await?;

        self.agents.write().await.insert(
            agent_id.clone(),
            AgentEntry {
                identity,
                state: AgentState::Idle,
                assignment: None,
                acceptance_deadline: None,
                last_progress_at: None,
                completions: VecDeque::new(),
                sender,
            },
        );
        self.presence.heartbeat(&agent_id).await;
        self.bus.publish(EventPayload::AgentConnected { agent_id: agent_id.clone() });
        self.bus.publish(EventPayload::AgentIdle { agent_id });
        Ok(())
    }

    /// Remove an agent; any in-flight task returns to the queue.
    pub async fn disconnect(&self, agent_id: &str, reason: &str) -> DomainResult<()> {
        let entry = self.agents.write().await.remove(agent_id);
        let Some(entry) = entry else {
            return Ok(());
        };

        if let Some(assignment) = entry.assignment {
            self.queue.requeue(assignment.task_id, "agent_disconnected").await?;
        }
        self.presence.remove(agent_id).await;
        self.bus.publish(EventPayload::AgentDisconnected {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        });
        tracing::info!(agent_id, reason, "Agent disconnected");
        Ok(())
    }

    /// Push a task onto an idle agent and arm the acceptance deadline.
    ///
    /// The caller has already won the queue-side assignment; a failure
    /// here means the caller must undo it.
    pub async fn push_task(&self, agent_id: &str, task: &Task) -> DomainResult<()> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| DomainError::AgentNotFound(agent_id.to_string()))?;

        if entry.state != AgentState::Idle {
            return Err(DomainError::AgentBusy {
                agent_id: agent_id.to_string(),
                state: entry.state.as_str().to_string(),
            });
        }

        let message = ServerMessage::assign_from(task);
        if entry.sender.send(message).is_err() {
            // Session write loop is gone; treat as a dead connection.
            return Err(DomainError::AgentNotFound(agent_id.to_string()));
        }

        entry.state = AgentState::Assigned;
        entry.assignment = Some(Assignment { task_id: task.id, generation: task.generation });
        entry.acceptance_deadline = Some(
            Utc::now()
                + Duration::milliseconds(
                    i64::try_from(self.config.acceptance_timeout_ms).unwrap_or(i64::MAX),
                ),
        );
        Ok(())
    }

    /// `task_accepted` from the agent.
    pub async fn on_accepted(&self, agent_id: &str, task_id: Uuid) -> DomainResult<()> {
        let generation = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else {
                return Ok(());
            };
            let Some(assignment) = entry.assignment.filter(|a| a.task_id == task_id) else {
                tracing::debug!(agent_id, %task_id, "task_accepted for a task the agent does not hold");
                return Ok(());
            };
            if entry.state != AgentState::Assigned {
                return Ok(());
            }
            entry.state = AgentState::Working;
            entry.acceptance_deadline = None;
            entry.last_progress_at = Some(Utc::now());
            assignment.generation
        };

        self.queue.accept(task_id, generation).await?;
        Ok(())
    }

    /// `task_rejected` from the agent: requeue immediately, no penalty.
    pub async fn on_rejected(&self, agent_id: &str, task_id: Uuid, reason: &str) -> DomainResult<()> {
        let held = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else {
                return Ok(());
            };
            let held = entry.assignment.filter(|a| a.task_id == task_id).is_some();
            if held {
                entry.state = AgentState::Idle;
                entry.assignment = None;
                entry.acceptance_deadline = None;
            }
            held
        };

        if held {
            tracing::debug!(agent_id, %task_id, reason, "Task rejected by agent");
            self.queue.requeue(task_id, "rejected_by_agent").await?;
            self.bus.publish(EventPayload::AgentIdle { agent_id: agent_id.to_string() });
        }
        Ok(())
    }

    /// `task_progress`: refresh the watchdog clocks.
    pub async fn on_progress(&self, agent_id: &str, task_id: Uuid) -> DomainResult<()> {
        let generation = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else {
                return Ok(());
            };
            entry.last_progress_at = Some(Utc::now());
            match entry.assignment.filter(|a| a.task_id == task_id) {
                Some(assignment) => assignment.generation,
                None => return Ok(()),
            }
        };
        self.queue.progress(task_id, generation).await?;
        Ok(())
    }

    /// `task_complete`: forward with the generation the agent reported.
    pub async fn on_complete(
        &self,
        agent_id: &str,
        task_id: Uuid,
        generation: u64,
        result: Option<serde_json::Value>,
    ) -> DomainResult<()> {
        self.queue.complete(task_id, generation, result).await?;
        self.release_if_held(agent_id, task_id, true).await;
        Ok(())
    }

    /// `task_failed`: forward with the generation the agent reported.
    pub async fn on_failed(
        &self,
        agent_id: &str,
        task_id: Uuid,
        generation: u64,
        reason: &str,
    ) -> DomainResult<Option<FailOutcome>> {
        let outcome = self.queue.fail(task_id, generation, reason).await?;
        self.release_if_held(agent_id, task_id, false).await;
        Ok(outcome)
    }

    /// `task_recovering` at reconnect: always reassign (requeue) for now.
    pub async fn on_recovering(&self, agent_id: &str, task_id: Uuid) -> DomainResult<ServerMessage> {
        tracing::info!(agent_id, %task_id, "Agent recovering; task will be reassigned");
        self.queue.requeue(task_id, "agent_recovering").await?;
        Ok(ServerMessage::TaskReassign { task_id })
    }

    async fn release_if_held(&self, agent_id: &str, task_id: Uuid, completed: bool) {
        let became_idle = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else {
                return;
            };
            if entry.assignment.filter(|a| a.task_id == task_id).is_none() {
                return;
            }
            entry.state = AgentState::Idle;
            entry.assignment = None;
            entry.acceptance_deadline = None;
            entry.last_progress_at = None;
            if completed {
                entry.completions.push_back(Utc::now());
                let cutoff = Utc::now() - Duration::seconds(COMPLETION_WINDOW_SECS);
                while entry.completions.front().is_some_and(|&t| t < cutoff) {
                    entry.completions.pop_front();
                }
            }
            true
        };
        if became_idle {
            self.bus.publish(EventPayload::AgentIdle { agent_id: agent_id.to_string() });
        }
    }

    /// Sweep-reclaim notification: if a connected agent still holds the
    /// reclaimed task, clear it and return the agent to idle.
    pub async fn clear_task(&self, task_id: Uuid) {
        let mut cleared: Option<String> = None;
        {
            let mut agents = self.agents.write().await;
            for (agent_id, entry) in agents.iter_mut() {
                if entry.assignment.is_some_and(|a| a.task_id == task_id) {
                    entry.state = AgentState::Idle;
                    entry.assignment = None;
                    entry.acceptance_deadline = None;
                    entry.last_progress_at = None;
                    cleared = Some(agent_id.clone());
                    break;
                }
            }
        }
        if let Some(agent_id) = cleared {
            tracing::debug!(agent_id = %agent_id, %task_id, "Cleared reclaimed task from agent");
            self.bus.publish(EventPayload::AgentIdle { agent_id });
        }
    }

    /// Expire acceptance deadlines and nag silent workers. Called from the
    /// registry tick loop; tests drive it directly.
    pub async fn check_timeouts(&self) -> DomainResult<()> {
        let now = Utc::now();
        let progress_threshold = Duration::milliseconds(
            i64::try_from(self.config.progress_watchdog_ms).unwrap_or(i64::MAX),
        );

        let mut expired: Vec<(String, Uuid)> = Vec::new();
        {
            let mut agents = self.agents.write().await;
            for (agent_id, entry) in agents.iter_mut() {
                match entry.state {
                    AgentState::Assigned => {
                        if entry.acceptance_deadline.is_some_and(|deadline| deadline < now) {
                            let assignment = entry.assignment.take();
                            entry.state = AgentState::Idle;
                            entry.acceptance_deadline = None;
                            if let Some(assignment) = assignment {
                                tracing::warn!(
                                    agent_id,
                                    task_id = %assignment.task_id,
                                    "Acceptance timeout; returning task to queue"
                                );
                                expired.push((agent_id.clone(), assignment.task_id));
                            }
                        }
                    }
                    AgentState::Working => {
                        if entry.last_progress_at.is_some_and(|t| now - t > progress_threshold) {
                            tracing::warn!(
                                agent_id,
                                task_id = ?entry.assignment.map(|a| a.task_id),
                                "No progress updates inside the watchdog window"
                            );
                            // The stuck sweep reclaims the task itself.
                            entry.last_progress_at = Some(now);
                        }
                    }
                    _ => {}
                }
            }
        }

        for (agent_id, task_id) in expired {
            self.queue.requeue(task_id, "acceptance_timeout").await?;
            self.bus.publish(EventPayload::AgentIdle { agent_id });
        }
        Ok(())
    }

    /// Evict agents whose heartbeat went stale.
    pub async fn reap_stale(&self) -> DomainResult<Vec<String>> {
        let threshold = Duration::milliseconds(
            i64::try_from(self.config.eviction_threshold_ms).unwrap_or(i64::MAX),
        );
        let stale = self.presence.stale(threshold).await;
        for agent_id in &stale {
            tracing::warn!(agent_id, "Evicting stale agent");
            self.disconnect(agent_id, "heartbeat_stale").await?;
        }
        Ok(stale)
    }

    /// Idle agents available for scheduling.
    pub async fn idle_agents(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        let mut idle = Vec::new();
        for entry in agents.values() {
            if entry.state == AgentState::Idle {
                let seen = self
                    .presence
                    .last_seen(&entry.identity.id)
                    .await
                    .unwrap_or_else(Utc::now);
                idle.push(entry.snapshot(seen));
            }
        }
        idle
    }

    pub async fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let agents = self.agents.read().await;
        let entry = agents.get(agent_id)?;
        let seen = self.presence.last_seen(agent_id).await.unwrap_or_else(Utc::now);
        Some(entry.snapshot(seen))
    }

    pub async fn snapshots(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        let mut all = Vec::new();
        for entry in agents.values() {
            let seen = self
                .presence
                .last_seen(&entry.identity.id)
                .await
                .unwrap_or_else(Utc::now);
            all.push(entry.snapshot(seen));
        }
        all
    }

    pub async fn connected_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Spawn the timeout/reaper loop.
    pub fn spawn_maintenance(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = std::time::Duration::from_millis(self.config.reaper_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.check_timeouts().await {
                    tracing::error!(error = %err, "Agent timeout check failed");
                }
                if let Err(err) = self.reap_stale().await {
                    tracing::error!(error = %err, "Agent reaper failed");
                }
            }
        })
    }
}
