//! Answers to general business questions.
//!
//! The responder always produces a reply. Credential failures and empty
//! completions are turned into fixed fallback messages so the chat handler
//! never has to deal with errors.

use std::sync::Arc;

use tracing::warn;

use crate::chat::{CompletionRequest, LlmClient, Message};
use crate::error::AiError;

pub const DEGRADED_REPLY: &str = "We're facing issues. Please try again later.";
pub const EMPTY_REPLY: &str = "Sorry, I couldn't get the answer. Try again.";
pub const FAILURE_REPLY: &str = "Something went wrong. Please try again later.";

const INQUIRY_TEMPERATURE: f32 = 0.5;

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are Aquabot, the assistant of a water purifier rental company.

You understand Hindi, English and Hinglish. Answer questions about the rental plans, installation, servicing and how to reach the owner. Keep answers short and formal."#;

pub struct InquiryResponder {
    client: Arc<dyn LlmClient>,
    system_prompt: String,
    temperature: f32,
}

impl InquiryResponder {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: INQUIRY_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Replace the business facts the model answers from.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub async fn answer(&self, question: &str) -> String {
        let request = CompletionRequest::new(vec![
            Message::system(self.system_prompt.as_str()),
            Message::user(question),
        ])
        .with_temperature(self.temperature);

        match self.client.complete(request).await {
            Ok(Some(reply)) if !reply.trim().is_empty() => reply,
            Ok(_) => EMPTY_REPLY.to_string(),
            Err(error @ AiError::Execution(_)) => {
                warn!(%error, "Answering with degraded reply");
                DEGRADED_REPLY.to_string()
            }
            Err(error) => {
                warn!(%error, "General question failed");
                FAILURE_REPLY.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLlmClient, MockStep};
    use aquabot_auth::{CallFailure, ExecutionError};

    /// Client that always fails the way an exhausted retry loop does.
    struct ExhaustedClient;

    #[async_trait::async_trait]
    impl LlmClient for ExhaustedClient {
        fn model(&self) -> &str {
            "exhausted"
        }

        async fn complete(&self, _request: CompletionRequest) -> crate::error::Result<Option<String>> {
            Err(AiError::Execution(ExecutionError::RetriesExhausted {
                attempts: 3,
                last: CallFailure::Status {
                    status: 401,
                    message: String::new(),
                },
            }))
        }
    }

    #[tokio::test]
    async fn returns_model_reply() {
        let mock = MockLlmClient::from_steps(vec![MockStep::text("Rent is 399 per month.")]);
        let responder = InquiryResponder::new(Arc::new(mock.clone())).with_system_prompt("facts");

        assert_eq!(responder.answer("rent?").await, "Rent is 399 per month.");
        let requests = mock.requests().await;
        assert_eq!(requests[0].messages[0], Message::system("facts"));
        assert_eq!(requests[0].temperature, INQUIRY_TEMPERATURE);
    }

    #[tokio::test]
    async fn empty_reply_uses_fallback() {
        let responder =
            InquiryResponder::new(Arc::new(MockLlmClient::from_steps(vec![MockStep::text("  ")])));
        assert_eq!(responder.answer("rent?").await, EMPTY_REPLY);
    }

    #[tokio::test]
    async fn credential_failure_degrades() {
        let responder = InquiryResponder::new(Arc::new(ExhaustedClient));
        assert_eq!(responder.answer("rent?").await, DEGRADED_REPLY);
    }

    #[tokio::test]
    async fn other_failures_use_generic_reply() {
        let responder = InquiryResponder::new(Arc::new(MockLlmClient::from_steps(vec![
            MockStep::Error("bad json".to_string()),
        ])));
        assert_eq!(responder.answer("rent?").await, FAILURE_REPLY);
    }
}
