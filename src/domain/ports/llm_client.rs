//! LLM client port.
//!
//! The orchestrator only knows two LLM operations: decompose a goal into a
//! plan of tasks and verify a finished goal against its children's results.
//! Both are long-running and are dispatched as detached tasks by the
//! caller; the port itself is a plain request/response interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::LlmError;
use crate::domain::models::dag::PlannedTask;

/// Input for a decomposition call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeRequest {
    pub goal_title: String,
    pub goal_description: String,
    pub success_criteria: Vec<String>,
    pub repo: Option<String>,
    /// Bounded file listing of the target repo.
    pub file_tree: Vec<String>,
    /// Corrective feedback from a failed validation pass, for re-prompts.
    pub feedback: Option<String>,
}

/// Output of a decomposition call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionPlan {
    pub tasks: Vec<PlannedTask>,
    pub tokens_used: u64,
}

/// Input for a verification call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub goal_title: String,
    pub goal_description: String,
    pub success_criteria: Vec<String>,
    /// Per-child summary: status plus result text and touched files.
    pub results_summary: Vec<TaskResultSummary>,
}

/// One child task's outcome as fed to the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultSummary {
    pub description: String,
    pub status: String,
    pub result: Option<String>,
    pub file_hints: Vec<String>,
}

/// Severity of a verification gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    Minor,
    Major,
    Critical,
}

/// One gap the verifier found between outcome and success criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationGap {
    pub description: String,
    pub severity: GapSeverity,
}

/// Verifier verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { gaps: Vec<VerificationGap> },
}

/// Outcome of a verification call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub verdict: Verdict,
    pub tokens_used: u64,
}

/// The LLM operations the orchestration core depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn decompose(&self, request: DecomposeRequest) -> Result<DecompositionPlan, LlmError>;

    async fn verify(&self, request: VerifyRequest) -> Result<VerificationOutcome, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_serde_shape() {
        let pass: Verdict = serde_json::from_str(r#"{"verdict":"pass"}"#).unwrap();
        assert_eq!(pass, Verdict::Pass);

        let fail: Verdict = serde_json::from_str(
            r#"{"verdict":"fail","gaps":[{"description":"missing tests","severity":"critical"}]}"#,
        )
        .unwrap();
        match fail {
            Verdict::Fail { gaps } => {
                assert_eq!(gaps.len(), 1);
                assert_eq!(gaps[0].severity, GapSeverity::Critical);
            }
            Verdict::Pass => panic!("expected fail"),
        }
    }
}
