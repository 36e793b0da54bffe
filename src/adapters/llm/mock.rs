//! Scripted mock LLM client for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::errors::LlmError;
use crate::domain::ports::{
    DecomposeRequest, DecompositionPlan, LlmClient, VerificationOutcome, VerifyRequest,
};

/// A mock that replays queued responses in order and records every request
/// it receives, so tests can assert on re-prompt feedback.
#[derive(Clone, Default)]
pub struct MockLlmClient {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    decompose_responses: VecDeque<Result<DecompositionPlan, LlmError>>,
    verify_responses: VecDeque<Result<VerificationOutcome, LlmError>>,
    decompose_requests: Vec<DecomposeRequest>,
    verify_requests: Vec<VerifyRequest>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_decompose(&self, response: Result<DecompositionPlan, LlmError>) {
        self.inner.lock().await.decompose_responses.push_back(response);
    }

    pub async fn push_verify(&self, response: Result<VerificationOutcome, LlmError>) {
        self.inner.lock().await.verify_responses.push_back(response);
    }

    /// Requests seen so far, oldest first.
    pub async fn decompose_requests(&self) -> Vec<DecomposeRequest> {
        self.inner.lock().await.decompose_requests.clone()
    }

    pub async fn verify_requests(&self) -> Vec<VerifyRequest> {
        self.inner.lock().await.verify_requests.clone()
    }

    pub async fn decompose_call_count(&self) -> usize {
        self.inner.lock().await.decompose_requests.len()
    }

    pub async fn verify_call_count(&self) -> usize {
        self.inner.lock().await.verify_requests.len()
    }
}

#[async_trait::async_trait]
impl LlmClient for MockLlmClient {
    async fn decompose(&self, request: DecomposeRequest) -> Result<DecompositionPlan, LlmError> {
        let mut inner = self.inner.lock().await;
        inner.decompose_requests.push(request);
        inner
            .decompose_responses
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::RequestFailed("mock: no response queued".to_string())))
    }

    async fn verify(&self, request: VerifyRequest) -> Result<VerificationOutcome, LlmError> {
        let mut inner = self.inner.lock().await;
        inner.verify_requests.push(request);
        inner
            .verify_responses
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::RequestFailed("mock: no response queued".to_string())))
    }
}
