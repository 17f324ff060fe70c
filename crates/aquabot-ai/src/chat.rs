//! OpenRouter chat-completions client

use aquabot_auth::{RetryingRequestExecutor, build_http_client};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AiError, Result};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "meta-llama/llama-4-maverick:free";

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: 0.2,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Completion backend used by the classifier and the responder.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    /// Returns the first choice's content, or `None` when the model sent none.
    async fn complete(&self, request: CompletionRequest) -> Result<Option<String>>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// OpenRouter client. Every call goes through the retrying executor, so a
/// rejected credential is rotated transparently.
pub struct OpenRouterClient {
    client: Client,
    executor: RetryingRequestExecutor,
    model: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(executor: RetryingRequestExecutor) -> Self {
        Self {
            client: build_http_client(),
            executor,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Set the model to use
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set custom base URL (for API-compatible services)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Option<String>> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
        };

        let response = self
            .executor
            .execute(|credential| {
                self.client
                    .post(&url)
                    .bearer_auth(credential.value())
                    .json(&body)
            })
            .await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidFormat(format!("Unreadable completion: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);
        debug!(model = %self.model, empty = content.is_none(), "Completion received");
        Ok(content)
    }
}
