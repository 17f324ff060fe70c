//! Deterministic mock LLM client for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::chat::{CompletionRequest, LlmClient};
use crate::error::{AiError, Result};

/// Scripted completion step.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Return this content.
    Text(String),
    /// Return a completion with no content.
    Empty,
    /// Fail with a generic LLM error.
    Error(String),
}

impl MockStep {
    pub fn text(content: impl Into<String>) -> Self {
        MockStep::Text(content.into())
    }
}

/// A mock client replaying scripted steps and recording requests.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    script: Arc<Mutex<VecDeque<MockStep>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlmClient {
    pub fn from_steps(steps: Vec<MockStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::from(steps))),
            requests: Arc::default(),
        }
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Option<String>> {
        self.requests.lock().await.push(request);
        match self.script.lock().await.pop_front() {
            Some(MockStep::Text(content)) => Ok(Some(content)),
            Some(MockStep::Empty) | None => Ok(None),
            Some(MockStep::Error(message)) => Err(AiError::Llm(message)),
        }
    }
}
