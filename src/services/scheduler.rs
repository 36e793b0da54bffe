//! Scheduler: matches queued tasks to idle agents.
//!
//! Runs on two triggers: bus events (submission, completion, an agent
//! going idle) and a periodic sweep. The sweep also reclaims stuck tasks
//! and expires queued tasks past their TTL.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::{RoutingConfig, SchedulerConfig};
use crate::domain::models::{AgentSnapshot, Task, TaskStatus};
use crate::services::agent_registry::AgentRegistry;
use crate::services::endpoint_registry::EndpointRegistry;
use crate::services::event_bus::{EventBus, EventPayload, HubEvent, Topic};
use crate::services::repo_registry::RepoRegistry;
use crate::services::task_queue::TaskQueue;
use crate::services::task_router;

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    agents: Arc<AgentRegistry>,
    endpoints: Arc<EndpointRegistry>,
    repos: Arc<RepoRegistry>,
    bus: Arc<EventBus>,
    routing_config: RoutingConfig,
    config: SchedulerConfig,
    /// When each task first hit an unroutable/fallback decision; the
    /// fallback is only applied after `fallback_wait_ms` to absorb
    /// transient endpoint outages.
    fallback_seen_at: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        agents: Arc<AgentRegistry>,
        endpoints: Arc<EndpointRegistry>,
        repos: Arc<RepoRegistry>,
        bus: Arc<EventBus>,
        routing_config: RoutingConfig,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            agents,
            endpoints,
            repos,
            bus,
            routing_config,
            config,
            fallback_seen_at: Mutex::new(HashMap::new()),
        }
    }

    /// One matching pass over the queue. Returns assignments made.
    pub async fn attempt_assignments(&self) -> DomainResult<usize> {
        let queued = self.queue.queued_in_order().await?;
        if queued.is_empty() {
            return Ok(0);
        }

        let mut idle = self.agents.idle_agents().await;
        if idle.is_empty() {
            return Ok(0);
        }

        let snapshot = self.endpoints.snapshot().await?;
        let repo_list = self.repos.snapshot().await?;
        let completed = self.completed_dependency_set(&queued).await?;

        let mut assigned = 0usize;
        for task in queued {
            if idle.is_empty() {
                break;
            }

            // Paused-repo filter; unregistered repos stay schedulable.
            if task.repo.as_deref().is_some_and(|url| repo_list.is_paused(url)) {
                continue;
            }

            // Dependency filter: every dependency must be completed.
            if !task.depends_on.iter().all(|dep| completed.contains(dep)) {
                continue;
            }

            let decision = task_router::route(&task, &snapshot, &self.routing_config);

            if !decision.is_dispatchable() {
                tracing::debug!(task_id = %task.id, reason = ?decision.fallback_reason, "Task is unroutable; leaving queued");
                continue;
            }

            if decision.fallback_used && !self.fallback_wait_elapsed(task.id).await {
                // Give the preferred tier a moment to come back.
                continue;
            }
            self.fallback_seen_at.lock().await.remove(&task.id);

            let Some(agent_index) = pick_agent(&idle, &task) else {
                continue;
            };
            let agent_id = idle[agent_index].id.clone();

            match self.queue.assign(task.id, &agent_id, task.generation).await {
                Ok(mut assigned_task) => {
                    assigned_task.routing_decision = Some(decision.clone());
                    self.queue.record_routing_decision(task.id, decision.clone()).await?;

                    if let (Some(endpoint_id), Some(repo)) =
                        (decision.selected_endpoint.as_deref(), assigned_task.repo.as_deref())
                    {
                        self.endpoints.note_repo_served(endpoint_id, repo).await;
                    }

                    match self.agents.push_task(&agent_id, &assigned_task).await {
                        Ok(()) => {
                            idle.remove(agent_index);
                            assigned += 1;
                        }
                        Err(err) => {
                            // The agent raced to busy/gone: undo the claim.
                            tracing::debug!(task_id = %task.id, agent_id = %agent_id, error = %err, "Push failed; requeueing");
                            self.queue.requeue(task.id, "push_failed").await?;
                            idle.remove(agent_index);
                        }
                    }
                }
                Err(err) if matches!(err, DomainError::StaleGeneration { .. } | DomainError::NotQueued(_)) => {
                    // Lost a race with another trigger; move on.
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(assigned)
    }

    async fn fallback_wait_elapsed(&self, task_id: Uuid) -> bool {
        let wait =
            Duration::milliseconds(i64::try_from(self.config.fallback_wait_ms).unwrap_or(i64::MAX));
        let mut seen = self.fallback_seen_at.lock().await;
        match seen.get(&task_id) {
            Some(&first_seen) => Utc::now() - first_seen >= wait,
            None => {
                seen.insert(task_id, Utc::now());
                wait.is_zero()
            }
        }
    }

    /// Statuses of every referenced dependency, collected once per pass.
    async fn completed_dependency_set(&self, queued: &[Task]) -> DomainResult<HashSet<Uuid>> {
        let mut referenced: HashSet<Uuid> = HashSet::new();
        for task in queued {
            referenced.extend(task.depends_on.iter().copied());
        }

        let mut completed = HashSet::new();
        for dep_id in referenced {
            if let Some(dep) = self.queue.get(dep_id).await? {
                if dep.status == TaskStatus::Completed {
                    completed.insert(dep_id);
                }
            }
        }
        Ok(completed)
    }

    /// Periodic sweep: reclaim stuck tasks and expire stale queued ones.
    pub async fn sweep(&self) -> DomainResult<()> {
        let stuck_threshold = Duration::milliseconds(
            i64::try_from(self.config.stuck_threshold_ms).unwrap_or(i64::MAX),
        );
        for task in self.queue.stuck_tasks(stuck_threshold).await? {
            tracing::warn!(task_id = %task.id, agent = ?task.assigned_to, "Reclaiming stuck task");
            self.queue.requeue(task.id, "stuck").await?;
            self.agents.clear_task(task.id).await;
        }

        let ttl =
            Duration::milliseconds(i64::try_from(self.config.task_ttl_ms).unwrap_or(i64::MAX));
        let expired = self.queue.expire_queued(ttl).await?;
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "Expired queued tasks past TTL");
            let mut seen = self.fallback_seen_at.lock().await;
            for task in &expired {
                seen.remove(&task.id);
            }
        }

        Ok(())
    }

    /// Run until the process shuts down: react to bus events and sweep on
    /// the configured interval.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut events = self.bus.subscribe();
        let sweep_interval =
            std::time::Duration::from_millis(self.config.sweep_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(event) if Self::is_trigger(&event) => {
                                if let Err(err) = self.attempt_assignments().await {
                                    tracing::error!(error = %err, "Assignment pass failed");
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(missed = n, "Scheduler lagged on the event bus");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep().await {
                            tracing::error!(error = %err, "Scheduler sweep failed");
                        }
                        if let Err(err) = self.attempt_assignments().await {
                            tracing::error!(error = %err, "Assignment pass failed");
                        }
                    }
                }
            }
        })
    }

    fn is_trigger(event: &HubEvent) -> bool {
        matches!(
            event.payload,
            EventPayload::TaskSubmitted { .. }
                | EventPayload::TaskCompleted { .. }
                | EventPayload::TaskFailed { .. }
                | EventPayload::TaskRequeued { .. }
                | EventPayload::AgentIdle { .. }
        ) || event.topic == Topic::Endpoints
    }
}

/// Choose the agent for a task: capabilities must cover the declared
/// needs; ties break on fewest recent completions, then id.
fn pick_agent(idle: &[AgentSnapshot], task: &Task) -> Option<usize> {
    let required: HashSet<String> = task.required_capabilities.iter().cloned().collect();
    idle.iter()
        .enumerate()
        .filter(|(_, agent)| agent.covers(&required))
        .min_by(|(_, a), (_, b)| {
            a.recently_completed
                .cmp(&b.recently_completed)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteEndpointRepository, SqliteRepoRegistryStore,
        SqliteTaskRepository,
    };
    use crate::domain::models::agent::AgentIdentity;
    use crate::domain::models::config::{AgentsConfig, ProberConfig};
    use crate::domain::models::protocol::ServerMessage;
    use crate::domain::models::routing::TargetType;
    use crate::domain::models::task::ComplexityTier;
    use crate::services::presence::Presence;
    use crate::services::task_queue::SubmitTask;
    use tokio::sync::mpsc;

    struct Fixture {
        scheduler: Scheduler,
        queue: Arc<TaskQueue>,
        agents: Arc<AgentRegistry>,
        repos: Arc<RepoRegistry>,
    }

    async fn setup(config: SchedulerConfig) -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let bus = Arc::new(EventBus::default());
        let repos = Arc::new(RepoRegistry::new(
            Arc::new(SqliteRepoRegistryStore::new(pool.clone())),
            None,
        ));
        let queue = Arc::new(TaskQueue::new(
            Arc::new(SqliteTaskRepository::new(pool.clone())),
            bus.clone(),
            repos.clone(),
        ));
        let agents = Arc::new(AgentRegistry::new(
            queue.clone(),
            Arc::new(Presence::new()),
            bus.clone(),
            AgentsConfig::default(),
        ));
        let endpoints = Arc::new(EndpointRegistry::new(
            Arc::new(SqliteEndpointRepository::new(pool)),
            bus.clone(),
            ProberConfig::default(),
        ));
        let scheduler = Scheduler::new(
            queue.clone(),
            agents.clone(),
            endpoints,
            repos.clone(),
            bus,
            RoutingConfig::default(),
            config,
        );
        Fixture { scheduler, queue, agents, repos }
    }

    fn no_wait() -> SchedulerConfig {
        SchedulerConfig { fallback_wait_ms: 0, ..SchedulerConfig::default() }
    }

    async fn connect(
        fixture: &Fixture,
        id: &str,
        capabilities: &[&str],
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        fixture
            .agents
            .connect(
                AgentIdentity {
                    id: id.to_string(),
                    name: None,
                    capabilities: capabilities.iter().map(|s| (*s).to_string()).collect(),
                    client_type: None,
                    protocol_version: 1,
                },
                tx,
            )
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_happy_path_with_cloud_fallback() {
        // Scenario: one active repo, no endpoints. A standard task inherits
        // the repo and routes to the cloud backstop.
        let fixture = setup(no_wait()).await;
        fixture.repos.add("https://r/a").await.unwrap();
        let _rx = connect(&fixture, "a-1", &[]).await;

        let (task, _) = fixture
            .queue
            .submit(SubmitTask {
                description: "short fix".to_string(),
                complexity_tier: Some(ComplexityTier::Standard),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(task.repo.as_deref(), Some("https://r/a"));

        let assigned = fixture.scheduler.attempt_assignments().await.unwrap();
        assert_eq!(assigned, 1);

        let task = fixture.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        let decision = task.routing_decision.unwrap();
        assert!(decision.fallback_used);
        assert_eq!(decision.fallback_reason.as_deref(), Some("no_healthy_ollama_endpoints"));
        assert_eq!(decision.target_type, Some(TargetType::Claude));
        assert_eq!(
            decision.estimated_cost_tier,
            Some(crate::domain::models::routing::CostTier::Api)
        );
    }

    #[tokio::test]
    async fn test_dependency_ordering() {
        let fixture = setup(no_wait()).await;
        let _rx1 = connect(&fixture, "a-1", &[]).await;
        let _rx2 = connect(&fixture, "a-2", &[]).await;

        let (first, _) = fixture
            .queue
            .submit(SubmitTask { description: "first".to_string(), ..Default::default() })
            .await
            .unwrap();
        let (second, _) = fixture
            .queue
            .submit(SubmitTask {
                description: "second".to_string(),
                depends_on: vec![first.id],
                ..Default::default()
            })
            .await
            .unwrap();
        let (third, _) = fixture
            .queue
            .submit(SubmitTask {
                description: "third".to_string(),
                depends_on: vec![second.id],
                ..Default::default()
            })
            .await
            .unwrap();

        // Two idle agents, but only the root of the chain is schedulable.
        let assigned = fixture.scheduler.attempt_assignments().await.unwrap();
        assert_eq!(assigned, 1);
        assert_eq!(
            fixture.queue.get(first.id).await.unwrap().unwrap().status,
            TaskStatus::Assigned
        );
        assert_eq!(
            fixture.queue.get(second.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );

        // Completing #1 unblocks #2 only; #2 and #3 never run in parallel.
        let t1 = fixture.queue.get(first.id).await.unwrap().unwrap();
        fixture.agents.on_accepted("a-1", first.id).await.unwrap();
        fixture
            .agents
            .on_complete("a-1", first.id, t1.generation, None)
            .await
            .unwrap();

        let assigned = fixture.scheduler.attempt_assignments().await.unwrap();
        assert_eq!(assigned, 1);
        assert_eq!(
            fixture.queue.get(second.id).await.unwrap().unwrap().status,
            TaskStatus::Assigned
        );
        assert_eq!(
            fixture.queue.get(third.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_paused_repo_filter() {
        let fixture = setup(no_wait()).await;
        let entry = fixture.repos.add("https://r/a").await.unwrap();
        let _rx = connect(&fixture, "a-1", &[]).await;

        let (task, _) = fixture
            .queue
            .submit(SubmitTask { description: "t".to_string(), ..Default::default() })
            .await
            .unwrap();

        fixture.repos.pause(&entry.id).await.unwrap();
        assert_eq!(fixture.scheduler.attempt_assignments().await.unwrap(), 0);
        assert_eq!(
            fixture.queue.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );

        // Unregistered repos remain schedulable.
        let (foreign, _) = fixture
            .queue
            .submit(SubmitTask {
                description: "t2".to_string(),
                repo: Some("https://other/repo".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fixture.scheduler.attempt_assignments().await.unwrap(), 1);
        assert_eq!(
            fixture.queue.get(foreign.id).await.unwrap().unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_capability_filter() {
        let fixture = setup(no_wait()).await;
        let _rx = connect(&fixture, "py-agent", &["python"]).await;

        let (task, _) = fixture
            .queue
            .submit(SubmitTask {
                description: "t".to_string(),
                required_capabilities: vec!["rust".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(fixture.scheduler.attempt_assignments().await.unwrap(), 0);

        let _rx2 = connect(&fixture, "rust-agent", &["rust", "git"]).await;
        assert_eq!(fixture.scheduler.attempt_assignments().await.unwrap(), 1);
        let task = fixture.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.assigned_to.as_deref(), Some("rust-agent"));
    }

    #[tokio::test]
    async fn test_fallback_wait_defers_first_pass() {
        let config = SchedulerConfig { fallback_wait_ms: 60_000, ..SchedulerConfig::default() };
        let fixture = setup(config).await;
        let _rx = connect(&fixture, "a-1", &[]).await;

        let (task, _) = fixture
            .queue
            .submit(SubmitTask {
                description: "t".to_string(),
                complexity_tier: Some(ComplexityTier::Standard),
                ..Default::default()
            })
            .await
            .unwrap();

        // Standard tier with no endpoints needs a fallback; the first pass
        // records the outage and defers.
        assert_eq!(fixture.scheduler.attempt_assignments().await.unwrap(), 0);
        assert_eq!(
            fixture.queue.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_tie_break_prefers_least_busy() {
        let fixture = setup(no_wait()).await;
        let _rx1 = connect(&fixture, "busy", &[]).await;
        let _rx2 = connect(&fixture, "fresh", &[]).await;

        // Give "busy" one completed task inside the window.
        let (warmup, _) = fixture
            .queue
            .submit(SubmitTask { description: "warmup".to_string(), ..Default::default() })
            .await
            .unwrap();
        let warmup = fixture.queue.assign(warmup.id, "busy", 0).await.unwrap();
        fixture.agents.push_task("busy", &warmup).await.unwrap();
        fixture.agents.on_accepted("busy", warmup.id).await.unwrap();
        fixture
            .agents
            .on_complete("busy", warmup.id, warmup.generation, None)
            .await
            .unwrap();

        let (task, _) = fixture
            .queue
            .submit(SubmitTask { description: "t".to_string(), ..Default::default() })
            .await
            .unwrap();
        fixture.scheduler.attempt_assignments().await.unwrap();

        let task = fixture.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.assigned_to.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_sweep_reclaims_stuck_and_expires_ttl() {
        let config = SchedulerConfig {
            stuck_threshold_ms: 0,
            task_ttl_ms: 3_600_000,
            ..no_wait()
        };
        let fixture = setup(config).await;
        let _rx = connect(&fixture, "a-1", &[]).await;

        let (task, _) = fixture
            .queue
            .submit(SubmitTask { description: "t".to_string(), ..Default::default() })
            .await
            .unwrap();
        fixture.scheduler.attempt_assignments().await.unwrap();
        assert_eq!(
            fixture.queue.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Assigned
        );

        // Zero stuck threshold: the sweep reclaims immediately and the
        // holding agent is cleared back to idle.
        fixture.scheduler.sweep().await.unwrap();
        let reclaimed = fixture.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert_eq!(reclaimed.generation, 2);
        assert_eq!(
            fixture.agents.snapshot("a-1").await.unwrap().state,
            crate::domain::models::AgentState::Idle
        );
    }

    #[tokio::test]
    async fn test_sweep_ttl_expiry() {
        let config = SchedulerConfig { task_ttl_ms: 0, ..no_wait() };
        let fixture = setup(config).await;

        let (task, _) = fixture
            .queue
            .submit(SubmitTask { description: "t".to_string(), ..Default::default() })
            .await
            .unwrap();

        fixture.scheduler.sweep().await.unwrap();
        assert!(fixture.queue.get(task.id).await.unwrap().is_none());
        let dead = fixture.queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, task.id);
    }
}
