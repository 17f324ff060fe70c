//! Intent classification for inbound chat messages.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chat::{CompletionRequest, LlmClient, Message};

const CLASSIFIER_TEMPERATURE: f32 = 0.2;

const CLASSIFIER_PROMPT: &str = r#"You are Aquabot, the assistant of a water purifier rental company.

Users may write in Hindi, English or Hinglish. Classify the message into exactly one intent:
- "complaint": the user reports a problem with their purifier.
- "installation": the user wants a new purifier installed.
- "payment": the user wants to pay or asks for a payment QR code.
- "general": fees, rental cost, contact details or any other business question.

Examples:
- "My RO isn't working" -> complaint
- "mera RO kaam nahi kar raha" -> complaint
- "installation karwana hai" -> installation
- "Send me the QR code" -> payment
- "rental fee kitna hai" -> general

Reply with one word only."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Complaint,
    Installation,
    Payment,
    General,
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = s
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_ascii_lowercase();
        match word.as_str() {
            "complaint" => Ok(Intent::Complaint),
            "installation" => Ok(Intent::Installation),
            "payment" => Ok(Intent::Payment),
            "general" => Ok(Intent::General),
            _ => Err(format!("Unknown intent: {}", s.trim())),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::Complaint => "complaint",
            Intent::Installation => "installation",
            Intent::Payment => "payment",
            Intent::General => "general",
        };
        f.write_str(name)
    }
}

/// Maps a message to an [`Intent`]. Never fails: unknown answers and every
/// error degrade to [`Intent::General`].
pub struct IntentClassifier {
    client: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub async fn classify(&self, message: &str) -> Intent {
        let request = CompletionRequest::new(vec![
            Message::system(CLASSIFIER_PROMPT),
            Message::user(message),
        ])
        .with_temperature(CLASSIFIER_TEMPERATURE);

        match self.client.complete(request).await {
            Ok(Some(answer)) => answer.parse().unwrap_or_else(|reason: String| {
                debug!(%reason, "Falling back to general intent");
                Intent::General
            }),
            Ok(None) => Intent::General,
            Err(error) => {
                warn!(%error, "Intent detection failed");
                Intent::General
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;
    use crate::mock::{MockLlmClient, MockStep};

    #[test]
    fn parses_model_answers_loosely() {
        assert_eq!("complaint".parse::<Intent>().unwrap(), Intent::Complaint);
        assert_eq!(" Payment.\n".parse::<Intent>().unwrap(), Intent::Payment);
        assert_eq!("\"installation\"".parse::<Intent>().unwrap(), Intent::Installation);
        assert!("cancel".parse::<Intent>().is_err());
    }

    #[tokio::test]
    async fn classifies_with_system_prompt_and_user_message() {
        let mock = MockLlmClient::from_steps(vec![MockStep::text("complaint")]);
        let classifier = IntentClassifier::new(Arc::new(mock.clone()));

        assert_eq!(classifier.classify("RO leaking").await, Intent::Complaint);

        let requests = mock.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert_eq!(requests[0].messages[1], Message::user("RO leaking"));
        assert_eq!(requests[0].temperature, CLASSIFIER_TEMPERATURE);
    }

    #[tokio::test]
    async fn unknown_answer_falls_back_to_general() {
        let classifier = IntentClassifier::new(Arc::new(MockLlmClient::from_steps(vec![
            MockStep::text("cancel"),
        ])));
        assert_eq!(classifier.classify("never mind").await, Intent::General);
    }

    #[tokio::test]
    async fn failure_falls_back_to_general() {
        let classifier = IntentClassifier::new(Arc::new(MockLlmClient::from_steps(vec![
            MockStep::Error("boom".to_string()),
        ])));
        assert_eq!(classifier.classify("QR bhejo").await, Intent::General);

        let classifier =
            IntentClassifier::new(Arc::new(MockLlmClient::from_steps(vec![MockStep::Empty])));
        assert_eq!(classifier.classify("QR bhejo").await, Intent::General);
    }
}
