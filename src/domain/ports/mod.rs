//! Port traits connecting the domain to adapters.

pub mod endpoint_repository;
pub mod goal_repository;
pub mod llm_client;
pub mod registry_repository;
pub mod task_repository;

pub use endpoint_repository::EndpointRepository;
pub use goal_repository::GoalRepository;
pub use llm_client::{
    DecomposeRequest, DecompositionPlan, GapSeverity, LlmClient, TaskResultSummary,
    VerificationGap, VerificationOutcome, Verdict, VerifyRequest,
};
pub use registry_repository::{AuthStore, RepoRegistryStore};
pub use task_repository::{FailOutcome, GoalProgress, TaskFilter, TaskRepository};
