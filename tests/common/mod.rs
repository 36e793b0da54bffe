#![allow(dead_code)]

//! Shared fixture for integration tests: the full orchestration core
//! wired over an in-memory database, a scripted LLM, and millisecond
//! timing knobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use agentcom::adapters::llm::MockLlmClient;
use agentcom::adapters::sqlite::{
    create_migrated_test_pool, SqliteEndpointRepository, SqliteGoalRepository,
    SqliteRepoRegistryStore, SqliteTaskRepository,
};
use agentcom::domain::models::agent::AgentIdentity;
use agentcom::domain::models::config::{
    AgentsConfig, BudgetConfig, HubConfig, ProberConfig, RoutingConfig, SchedulerConfig,
};
use agentcom::domain::models::protocol::ServerMessage;
use agentcom::services::{
    AgentRegistry, BudgetLedger, CycleHooks, EndpointRegistry, EventBus, GoalBacklog,
    GoalOrchestrator, HealthAggregator, HubFsm, OrchestratorConfig, Presence, RepoRegistry,
    Scheduler, TaskQueue,
};

pub struct Harness {
    pub bus: Arc<EventBus>,
    pub repos: Arc<RepoRegistry>,
    pub queue: Arc<TaskQueue>,
    pub backlog: Arc<GoalBacklog>,
    pub endpoints: Arc<EndpointRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<GoalOrchestrator>,
    pub hub: Arc<HubFsm>,
    pub llm: MockLlmClient,
    pub budget: Arc<BudgetLedger>,
    pub presence: Arc<Presence>,
}

pub struct HarnessConfig {
    pub scheduler: SchedulerConfig,
    pub agents: AgentsConfig,
    pub hub: HubConfig,
    pub workspace_root: PathBuf,
    pub hooks: CycleHooks,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig { fallback_wait_ms: 0, ..SchedulerConfig::default() },
            agents: AgentsConfig::default(),
            hub: HubConfig::default(),
            workspace_root: PathBuf::from("/nonexistent-workspace"),
            hooks: CycleHooks::default(),
        }
    }
}

pub async fn harness(config: HarnessConfig) -> Harness {
    let pool = create_migrated_test_pool().await.expect("test pool");
    let bus = Arc::new(EventBus::default());
    let presence = Arc::new(Presence::new());

    let repos = Arc::new(RepoRegistry::new(
        Arc::new(SqliteRepoRegistryStore::new(pool.clone())),
        None,
    ));
    let queue = Arc::new(TaskQueue::new(
        Arc::new(SqliteTaskRepository::new(pool.clone())),
        bus.clone(),
        repos.clone(),
    ));
    let backlog = Arc::new(GoalBacklog::new(
        Arc::new(SqliteGoalRepository::new(pool.clone())),
        bus.clone(),
        repos.clone(),
    ));
    let endpoints = Arc::new(EndpointRegistry::new(
        Arc::new(SqliteEndpointRepository::new(pool)),
        bus.clone(),
        ProberConfig::default(),
    ));
    let agents = Arc::new(AgentRegistry::new(
        queue.clone(),
        presence.clone(),
        bus.clone(),
        config.agents,
    ));
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        agents.clone(),
        endpoints.clone(),
        repos.clone(),
        bus.clone(),
        RoutingConfig::default(),
        config.scheduler,
    ));

    let budget = Arc::new(BudgetLedger::new(&BudgetConfig::default()));
    let llm = MockLlmClient::new();
    let orchestrator = Arc::new(GoalOrchestrator::new(
        backlog.clone(),
        queue.clone(),
        Arc::new(llm.clone()),
        budget.clone(),
        &bus,
        OrchestratorConfig {
            workspace_root: config.workspace_root,
            llm_timeout: Duration::from_secs(5),
        },
    ));
    let health = Arc::new(HealthAggregator::new(
        queue.clone(),
        presence.clone(),
        endpoints.clone(),
        bus.clone(),
        chrono::Duration::zero(),
    ));
    let hub = Arc::new(HubFsm::new(
        backlog.clone(),
        orchestrator.clone(),
        budget.clone(),
        health,
        bus.clone(),
        config.hooks,
        config.hub,
    ));

    Harness {
        bus,
        repos,
        queue,
        backlog,
        endpoints,
        agents,
        scheduler,
        orchestrator,
        hub,
        llm,
        budget,
        presence,
    }
}

/// Connect a fake agent and return the channel its session would drain.
pub async fn connect_agent(
    harness: &Harness,
    id: &str,
    capabilities: &[&str],
) -> mpsc::UnboundedReceiver<ServerMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    harness
        .agents
        .connect(
            AgentIdentity {
                id: id.to_string(),
                name: None,
                capabilities: capabilities.iter().map(|s| (*s).to_string()).collect(),
                client_type: Some("test".to_string()),
                protocol_version: 1,
            },
            tx,
        )
        .await
        .expect("agent connect");
    rx
}

/// Tick the orchestrator until detached LLM work settles.
pub async fn settle_orchestrator(harness: &Harness) {
    for _ in 0..25 {
        harness.orchestrator.tick().await.expect("orchestrator tick");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
