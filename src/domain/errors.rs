//! Domain errors for the AgentCom hub.
//!
//! Errors follow the taxonomy: validation errors return to the caller,
//! stale-concurrency errors are silent no-ops at the call site, transient
//! integration errors retry once and then surface typed, storage errors
//! propagate so the owning service crashes and is restarted.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Goal not found: {0}")]
    GoalNotFound(Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Repo not found: {0}")]
    RepoNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Assignment/completion carried a generation that no longer matches.
    /// Callers treat this as a silent no-op per the fencing contract.
    #[error("Stale generation for task {task_id}: expected {expected}, found {found}")]
    StaleGeneration { task_id: Uuid, expected: u64, found: u64 },

    /// Assignment attempted on a task that left the queued state.
    #[error("Task {0} is not queued")]
    NotQueued(Uuid),

    #[error("Agent {agent_id} is not idle (state: {state})")]
    AgentBusy { agent_id: String, state: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Dependency cycle detected involving task {0}")]
    DependencyCycle(Uuid),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Budget exhausted")]
    BudgetExhausted,
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether this is the stale-concurrency case that callers drop silently.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleGeneration { .. })
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Errors from LLM invocations (decomposition, verification).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("LLM rate limit exceeded")]
    RateLimitExceeded,

    #[error("LLM authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("LLM response could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("LLM call timed out after {0} seconds")]
    Timeout(u64),

    #[error("LLM API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Budget exhausted")]
    BudgetExhausted,
}

impl LlmError {
    /// Transient errors are retried once at the call site before surfacing.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RateLimitExceeded | Self::Timeout(_) | Self::RequestFailed(_) => true,
            Self::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Permanent errors go straight to the orchestrator.
    pub const fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}
