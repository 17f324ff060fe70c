//! Aquabot AI - language-model features behind the chat bot
//!
//! - [`OpenRouterClient`]: chat completions issued through the credential
//!   executor, so rotation is invisible to callers
//! - [`IntentClassifier`]: routes inbound messages
//! - [`InquiryResponder`]: answers general questions, degrading to fixed
//!   replies instead of failing

pub mod chat;
pub mod error;
pub mod inquiry;
pub mod intent;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use chat::{CompletionRequest, LlmClient, Message, OpenRouterClient, Role};
pub use error::{AiError, Result};
pub use inquiry::InquiryResponder;
pub use intent::{Intent, IntentClassifier};
