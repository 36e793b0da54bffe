//! HTTP API surface.
//!
//! Bearer-token authenticated REST endpoints over the core services plus
//! the agent WebSocket upgrade. Every caller is rate-limited per agent id
//! after authentication.

use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::domain::errors::DomainError;
use crate::domain::models::config::RateLimitConfig;
use crate::domain::models::{
    ComplexityTier, GoalPriority, GoalSource, TaskPriority, TaskWarning,
};
use crate::domain::ports::AuthStore;
use crate::services::agent_registry::AgentRegistry;
use crate::services::endpoint_registry::EndpointRegistry;
use crate::services::goal_backlog::{GoalBacklog, SubmitGoal};
use crate::services::hub_fsm::HubFsm;
use crate::services::repo_registry::RepoRegistry;
use crate::services::task_queue::{SubmitTask, TaskQueue};

use super::ws::{ws_agent, WsState};

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Shared state for the HTTP API.
pub struct ApiState {
    pub queue: Arc<TaskQueue>,
    pub backlog: Arc<GoalBacklog>,
    pub hub: Arc<HubFsm>,
    pub repos: Arc<RepoRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub auth: Arc<dyn AuthStore>,
    pub limiter: Arc<KeyedLimiter>,
}

impl ApiState {
    pub fn limiter_from(config: &RateLimitConfig) -> Arc<KeyedLimiter> {
        let per_second = NonZeroU32::new(config.requests_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size.max(1)).unwrap_or(NonZeroU32::MIN);
        Arc::new(RateLimiter::keyed(Quota::per_second(per_second).allow_burst(burst)))
    }
}

/// Build the full router, WebSocket endpoint included.
pub fn build_router(api: Arc<ApiState>, ws: Arc<WsState>) -> Router {
    let authenticated = Router::new()
        .route("/goals", post(submit_goal).get(list_goals))
        .route("/goals/{id}", get(get_goal).delete(delete_goal))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/dead-letter", get(list_dead_letters))
        .route("/tasks/dead-letter/{id}/retry", post(retry_dead_letter))
        .route("/tasks/{id}", get(get_task))
        .route("/agents", get(list_agents))
        .route("/api/admin/repo-registry", post(add_repo).get(list_repos))
        .route("/api/admin/repo-registry/{id}", delete(remove_repo))
        .route("/api/admin/repo-registry/{id}/move-up", put(move_repo_up))
        .route("/api/admin/repo-registry/{id}/move-down", put(move_repo_down))
        .route("/api/admin/repo-registry/{id}/pause", put(pause_repo))
        .route("/api/admin/repo-registry/{id}/unpause", put(unpause_repo))
        .route("/api/admin/llm-registry", post(add_endpoint).get(list_endpoints))
        .route("/api/admin/llm-registry/{id}", delete(remove_endpoint))
        .route("/api/hub/state", get(hub_state))
        .route("/api/hub/pause", post(hub_pause))
        .route("/api/hub/resume", post(hub_resume))
        .route("/api/hub/history", get(hub_history))
        .layer(middleware::from_fn_with_state(api.clone(), authenticate))
        .with_state(api);

    Router::new()
        .route("/health", get(health))
        .route("/ws/agent", get(ws_agent).with_state(ws))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

/// Serve until the shutdown future resolves.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    tracing::info!(%addr, "HTTP server listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Error envelope shared by every endpoint.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into(), code: code.to_string() })).into_response()
}

fn domain_error(err: DomainError) -> Response {
    let (status, code) = match &err {
        DomainError::TaskNotFound(_)
        | DomainError::GoalNotFound(_)
        | DomainError::AgentNotFound(_)
        | DomainError::EndpointNotFound(_)
        | DomainError::RepoNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        DomainError::ValidationFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
        DomainError::InvalidStateTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        DomainError::StaleGeneration { .. } | DomainError::NotQueued(_) => {
            (StatusCode::CONFLICT, "conflict")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    error_response(status, code, err.to_string())
}

/// Bearer auth + per-agent rate limiting.
async fn authenticate(
    State(state): State<Arc<ApiState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "Missing bearer token");
    };

    let agent_id = match state.auth.resolve(token).await {
        Ok(Some(agent_id)) => agent_id,
        Ok(None) => {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "Unknown token")
        }
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
        }
    };

    if state.limiter.check_key(&agent_id).is_err() {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Rate limit exceeded",
        );
    }

    request.extensions_mut().insert(agent_id);
    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "agentcom" }))
}

// ---------------------------------------------------------------------------
// Goals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubmitGoalRequest {
    title: String,
    description: String,
    #[serde(default)]
    success_criteria: Vec<String>,
    priority: Option<String>,
    repo: Option<String>,
    metadata: Option<serde_json::Value>,
}

async fn submit_goal(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SubmitGoalRequest>,
) -> Response {
    let priority = match request.priority.as_deref().map(parse_goal_priority).transpose() {
        Ok(priority) => priority,
        Err(response) => return response,
    };

    match state
        .backlog
        .submit(SubmitGoal {
            title: request.title,
            description: request.description,
            success_criteria: request.success_criteria,
            priority,
            source: Some(GoalSource::Api),
            repo: request.repo,
            metadata: request.metadata,
        })
        .await
    {
        Ok(goal) => (StatusCode::CREATED, Json(goal)).into_response(),
        Err(err) => domain_error(err),
    }
}

async fn list_goals(State(state): State<Arc<ApiState>>) -> Response {
    match state.backlog.list().await {
        Ok(goals) => Json(goals).into_response(),
        Err(err) => domain_error(err),
    }
}

async fn get_goal(State(state): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> Response {
    match state.backlog.get(id).await {
        Ok(Some(goal)) => Json(goal).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", format!("Goal not found: {id}")),
        Err(err) => domain_error(err),
    }
}

async fn delete_goal(State(state): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> Response {
    match state.backlog.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => domain_error(err),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    description: String,
    goal_id: Option<Uuid>,
    #[serde(default)]
    depends_on: Vec<Uuid>,
    repo: Option<String>,
    branch: Option<String>,
    #[serde(default)]
    file_hints: Vec<crate::domain::models::task::FileHint>,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    verification_steps: Vec<crate::domain::models::task::VerificationStep>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    priority: Option<String>,
    complexity_tier: Option<String>,
    max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task: crate::domain::models::Task,
    warnings: Vec<TaskWarning>,
}

async fn submit_task(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SubmitTaskRequest>,
) -> Response {
    let priority = match request.priority.as_deref() {
        Some(s) => match TaskPriority::from_str(s) {
            Some(priority) => Some(priority),
            None => {
                return error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "validation",
                    format!("Unknown priority: {s}"),
                )
            }
        },
        None => None,
    };
    let complexity_tier = match request.complexity_tier.as_deref() {
        Some(s) => match ComplexityTier::from_str(s) {
            Some(tier) => Some(tier),
            None => {
                return error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "validation",
                    format!("Unknown complexity tier: {s}"),
                )
            }
        },
        None => None,
    };

    match state
        .queue
        .submit(SubmitTask {
            description: request.description,
            goal_id: request.goal_id,
            depends_on: request.depends_on,
            repo: request.repo,
            branch: request.branch,
            file_hints: request.file_hints,
            success_criteria: request.success_criteria,
            verification_steps: request.verification_steps,
            required_capabilities: request.required_capabilities,
            priority,
            complexity_tier,
            max_retries: request.max_retries,
        })
        .await
    {
        Ok((task, warnings)) => {
            (StatusCode::CREATED, Json(SubmitTaskResponse { task, warnings })).into_response()
        }
        Err(err) => domain_error(err),
    }
}

async fn list_tasks(State(state): State<Arc<ApiState>>) -> Response {
    match state.queue.list(crate::domain::ports::TaskFilter::default()).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => domain_error(err),
    }
}

async fn get_task(State(state): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> Response {
    match state.queue.get(id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", format!("Task not found: {id}")),
        Err(err) => domain_error(err),
    }
}

async fn list_dead_letters(State(state): State<Arc<ApiState>>) -> Response {
    match state.queue.dead_letters().await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => domain_error(err),
    }
}

async fn retry_dead_letter(State(state): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> Response {
    match state.queue.retry_dead_letter(id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Dead-letter task not found: {id}"),
        ),
        Err(err) => domain_error(err),
    }
}

async fn list_agents(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.agents.snapshots().await).into_response()
}

// ---------------------------------------------------------------------------
// Admin: repo registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddRepoRequest {
    url: String,
}

async fn add_repo(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<AddRepoRequest>,
) -> Response {
    match state.repos.add(&request.url).await {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => domain_error(err),
    }
}

async fn list_repos(State(state): State<Arc<ApiState>>) -> Response {
    match state.repos.snapshot().await {
        Ok(list) => Json(list).into_response(),
        Err(err) => domain_error(err),
    }
}

macro_rules! repo_mutation {
    ($name:ident, $method:ident) => {
        async fn $name(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
            match state.repos.$method(&id).await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(err) => domain_error(err),
            }
        }
    };
}

repo_mutation!(remove_repo, remove);
repo_mutation!(move_repo_up, move_up);
repo_mutation!(move_repo_down, move_down);
repo_mutation!(pause_repo, pause);
repo_mutation!(unpause_repo, unpause);

// ---------------------------------------------------------------------------
// Admin: LLM endpoint registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddEndpointRequest {
    url: String,
}

async fn add_endpoint(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<AddEndpointRequest>,
) -> Response {
    match state.endpoints.register(&request.url).await {
        Ok(endpoint) => (StatusCode::CREATED, Json(endpoint)).into_response(),
        Err(err) => domain_error(err),
    }
}

async fn list_endpoints(State(state): State<Arc<ApiState>>) -> Response {
    match state.endpoints.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => domain_error(err),
    }
}

async fn remove_endpoint(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.endpoints.remove(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => domain_error(err),
    }
}

// ---------------------------------------------------------------------------
// Hub controls
// ---------------------------------------------------------------------------

async fn hub_state(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.hub.status().await).into_response()
}

async fn hub_pause(State(state): State<Arc<ApiState>>) -> Response {
    state.hub.pause().await;
    Json(state.hub.status().await).into_response()
}

async fn hub_resume(State(state): State<Arc<ApiState>>) -> Response {
    state.hub.resume().await;
    Json(state.hub.status().await).into_response()
}

async fn hub_history(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.hub.history().await).into_response()
}

fn parse_goal_priority(s: &str) -> Result<GoalPriority, Response> {
    GoalPriority::from_str(s).ok_or_else(|| {
        error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation",
            format!("Unknown priority: {s}"),
        )
    })
}
