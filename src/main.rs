//! AgentCom hub entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use agentcom::adapters::llm::ClaudeLlmClient;
use agentcom::adapters::sqlite::{
    initialize_database, SqliteAuthStore, SqliteEndpointRepository, SqliteGoalRepository,
    SqliteRepoRegistryStore, SqliteTaskRepository,
};
use agentcom::domain::models::Config;
use agentcom::infrastructure::http::{build_router, serve, ApiState};
use agentcom::infrastructure::ws::WsState;
use agentcom::infrastructure::{logging, ConfigLoader};
use agentcom::services::{
    hub_fsm::HealingActions, AgentRegistry, BudgetLedger, CycleHooks, EndpointRegistry, EventBus,
    GoalBacklog, GoalOrchestrator, HealthAggregator, HubFsm, NoopCycle, OrchestratorConfig,
    Presence, RepoRegistry, Scheduler, TaskQueue,
};

#[derive(Parser)]
#[command(name = "agentcom", about = "Single-node agent coordination hub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a config file (overrides the .agentcom/ hierarchy).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub (default).
    Serve,
    /// Validate configuration and exit.
    ConfigCheck,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration errors exit with code 2, before anything else starts.
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(2);
        }
    };

    if matches!(cli.command, Some(Commands::ConfigCheck)) {
        println!("configuration ok");
        return ExitCode::SUCCESS;
    }

    if let Err(err) = logging::init(&config.logging) {
        eprintln!("configuration error: {err:#}");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Hub exited with an error");
            // Storage failures are the unrecoverable case.
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "AgentCom hub starting");

    // Storage.
    let database_url = format!("sqlite:{}", config.database.path);
    let pool = initialize_database(&database_url)
        .await
        .context("Failed to open the hub database")?;

    // Core plumbing.
    let bus = Arc::new(EventBus::default());
    let presence = Arc::new(Presence::new());
    let auth = Arc::new(SqliteAuthStore::new(pool.clone()));
    let budget = Arc::new(BudgetLedger::new(&config.budget));

    let repos = Arc::new(RepoRegistry::new(
        Arc::new(SqliteRepoRegistryStore::new(pool.clone())),
        config.default_repo.clone(),
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
        Arc::new(SqliteEndpointRepository::new(pool.clone())),
        bus.clone(),
        config.prober.clone(),
    ));
    let agents = Arc::new(AgentRegistry::new(
        queue.clone(),
        presence.clone(),
        bus.clone(),
        config.agents.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        agents.clone(),
        endpoints.clone(),
        repos.clone(),
        bus.clone(),
        config.routing.clone(),
        config.scheduler.clone(),
    ));

    let llm = Arc::new(
        ClaudeLlmClient::from_config(&config.llm)
            .context("Failed to build the LLM client")?,
    );
    let orchestrator = Arc::new(GoalOrchestrator::new(
        backlog.clone(),
        queue.clone(),
        llm,
        budget.clone(),
        &bus,
        OrchestratorConfig {
            workspace_root: PathBuf::from(&config.workspace_root),
            llm_timeout: Duration::from_millis(config.llm.timeout_ms),
        },
    ));

    let health = Arc::new(HealthAggregator::new(
        queue.clone(),
        presence.clone(),
        endpoints.clone(),
        bus.clone(),
        chrono::Duration::seconds(10),
    ));
    let hub = Arc::new(HubFsm::new(
        backlog.clone(),
        orchestrator,
        budget,
        health.clone(),
        bus.clone(),
        CycleHooks {
            improvement: Arc::new(NoopCycle),
            contemplation: Arc::new(NoopCycle),
            healing: Arc::new(HealingActions {
                scheduler: scheduler.clone(),
                endpoints: endpoints.clone(),
                bus: bus.clone(),
            }),
        },
        config.hub.clone(),
    ));

    // Health aggregator outcome feed.
    {
        let health = health.clone();
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => health.observe(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Background loops.
    let _prober = endpoints.clone().spawn_prober();
    let _maintenance = agents.clone().spawn_maintenance();
    let _scheduler_loop = scheduler.clone().spawn();
    let _hub_loop = hub.clone().spawn();

    // HTTP + WebSocket surface.
    let api = Arc::new(ApiState {
        queue,
        backlog,
        hub,
        repos,
        endpoints: endpoints.clone(),
        agents: agents.clone(),
        auth: auth.clone(),
        limiter: ApiState::limiter_from(&config.rate_limit),
    });
    let ws = Arc::new(WsState {
        registry: agents,
        endpoints,
        presence,
        auth,
        config: config.agents.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    serve(build_router(api, ws), addr, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    tracing::info!("AgentCom hub stopped");
    Ok(())
}
