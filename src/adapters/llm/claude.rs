//! Claude HTTP API client for decomposition and verification.
//!
//! One reqwest client with connection pooling, a hard request timeout, and
//! a single retry on transient errors before the typed error surfaces to
//! the orchestrator.

use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::errors::LlmError;
use crate::domain::models::config::LlmConfig;
use crate::domain::models::dag::PlannedTask;
use crate::domain::ports::{
    DecomposeRequest, DecompositionPlan, LlmClient, VerificationOutcome, Verdict, VerifyRequest,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeLlmClient {
    http_client: ReqwestClient,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout_secs: u64,
}

impl ClaudeLlmClient {
    /// Build from config; the API key comes from the configured env var.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            LlmError::AuthenticationFailed(format!("{} is not set", config.api_key_env))
        })?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let http_client = ReqwestClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        Ok(Self {
            http_client,
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_ms / 1000,
        })
    }

    async fn send_prompt(&self, system: &str, user: String) -> Result<(String, u64), LlmError> {
        let request = MessageRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system.to_string(),
            messages: vec![Message { role: "user".to_string(), content: user }],
        };

        // Retry once on transient errors, then surface typed.
        match self.send_once(&request).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_transient() => {
                tracing::debug!(error = %err, "Transient LLM error, retrying once");
                self.send_once(&request).await
            }
            Err(err) => Err(err),
        }
    }

    async fn send_once(&self, request: &MessageRequest) -> Result<(String, u64), LlmError> {
        let response = self
            .http_client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthenticationFailed(body),
                429 => LlmError::RateLimitExceeded,
                code => LlmError::ApiError { status: code, message: body },
            });
        }

        let parsed: MessageResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
            })
            .collect::<Vec<_>>()
            .join("");
        let tokens = parsed.usage.input_tokens + parsed.usage.output_tokens;

        Ok((text, tokens))
    }
}

#[async_trait::async_trait]
impl LlmClient for ClaudeLlmClient {
    async fn decompose(&self, request: DecomposeRequest) -> Result<DecompositionPlan, LlmError> {
        let user = build_decompose_prompt(&request);
        let (text, tokens_used) = self.send_prompt(DECOMPOSE_SYSTEM, user).await?;

        let body = extract_json(&text)
            .ok_or_else(|| LlmError::InvalidResponse("no JSON object in response".to_string()))?;
        let parsed: DecomposeResponse = serde_json::from_str(body)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(DecompositionPlan { tasks: parsed.tasks, tokens_used })
    }

    async fn verify(&self, request: VerifyRequest) -> Result<VerificationOutcome, LlmError> {
        let user = build_verify_prompt(&request);
        let (text, tokens_used) = self.send_prompt(VERIFY_SYSTEM, user).await?;

        let body = extract_json(&text)
            .ok_or_else(|| LlmError::InvalidResponse("no JSON object in response".to_string()))?;
        let verdict: Verdict = serde_json::from_str(body)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(VerificationOutcome { verdict, tokens_used })
    }
}

const DECOMPOSE_SYSTEM: &str = "You are a planning assistant that breaks a software goal into \
a small set of independent tasks. Respond with a single JSON object of the form \
{\"tasks\": [{\"description\": string, \"depends_on\": [int], \"file_paths\": [string], \
\"success_criteria\": [string]}]}. depends_on holds 0-based indices into the task list. \
Only reference files that appear in the provided file tree.";

const VERIFY_SYSTEM: &str = "You are a reviewer deciding whether a goal was achieved from its \
tasks' results. Respond with a single JSON object: {\"verdict\": \"pass\"} or \
{\"verdict\": \"fail\", \"gaps\": [{\"description\": string, \"severity\": \
\"minor\"|\"major\"|\"critical\"}]}.";

fn build_decompose_prompt(request: &DecomposeRequest) -> String {
    let mut prompt = format!(
        "Goal: {}\n\nDescription:\n{}\n",
        request.goal_title, request.goal_description
    );
    if !request.success_criteria.is_empty() {
        prompt.push_str("\nSuccess criteria:\n");
        for criterion in &request.success_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }
    if let Some(repo) = &request.repo {
        prompt.push_str(&format!("\nRepository: {repo}\n"));
    }
    if !request.file_tree.is_empty() {
        prompt.push_str("\nFile tree:\n");
        for path in &request.file_tree {
            prompt.push_str(&format!("{path}\n"));
        }
    }
    if let Some(feedback) = &request.feedback {
        prompt.push_str(&format!(
            "\nYour previous plan was rejected. Fix the following and respond again:\n{feedback}\n"
        ));
    }
    prompt
}

fn build_verify_prompt(request: &VerifyRequest) -> String {
    let mut prompt = format!(
        "Goal: {}\n\nDescription:\n{}\n",
        request.goal_title, request.goal_description
    );
    if !request.success_criteria.is_empty() {
        prompt.push_str("\nSuccess criteria:\n");
        for criterion in &request.success_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }
    prompt.push_str("\nTask results:\n");
    for summary in &request.results_summary {
        prompt.push_str(&format!(
            "- [{}] {}\n",
            summary.status, summary.description
        ));
        if let Some(result) = &summary.result {
            prompt.push_str(&format!("  result: {result}\n"));
        }
        if !summary.file_hints.is_empty() {
            prompt.push_str(&format!("  files: {}\n", summary.file_hints.join(", ")));
        }
    }
    prompt
}

/// Extract the outermost JSON object from model output, tolerating code
/// fences and prose around it.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct DecomposeResponse {
    tasks: Vec<PlannedTask>,
}
