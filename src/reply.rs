//! Reply service: turns a completed utterance into assistant text.
//!
//! The remote chat backend is an opaque collaborator behind the
//! [`ReplyService`] trait; the HTTP implementation posts the conversation
//! (system persona + rolling history + new utterance) to an OpenAI-style
//! chat completions endpoint.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Default chat completions endpoint.
pub const DEFAULT_REPLY_URL: &str = "https://api.openai.com/v1/chat/completions";

/// One message of the rolling conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// "system", "user" or "assistant".
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Errors that can occur while fetching a reply.
#[derive(Debug)]
pub enum ReplyError {
    /// API key not configured
    MissingApiKey,
    /// Network/HTTP error
    NetworkError(String),
    /// The service returned an error
    ApiError { status: u16, message: String },
    /// Failed to parse the service response
    ParseError(String),
    /// The service answered with no usable text
    EmptyReply,
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set OPENAI_API_KEY environment variable."
                )
            }
            ReplyError::NetworkError(e) => write!(f, "Network error: {}", e),
            ReplyError::ApiError { status, message } => {
                write!(f, "Reply service error ({}): {}", status, message)
            }
            ReplyError::ParseError(e) => write!(f, "Failed to parse reply response: {}", e),
            ReplyError::EmptyReply => write!(f, "Reply service returned no text"),
        }
    }
}

impl std::error::Error for ReplyError {}

/// The remote chat backend.
#[async_trait::async_trait]
pub trait ReplyService: Send + Sync {
    /// Produce the assistant's reply to a conversation.
    ///
    /// `messages` is the rolling history, newest last; the final entry is
    /// the utterance being answered.
    async fn reply(&self, messages: &[ChatMessage]) -> Result<String, ReplyError>;
}

/// Configuration for the HTTP reply client.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    /// Persona prepended to every request as the system message.
    pub system_prompt: String,
}

impl ReplyConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_REPLY_URL.to_string(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful voice concierge. Answer briefly; \
                            your replies are spoken aloud."
                .to_string(),
        }
    }
}

/// Chat completions request body.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

/// Chat completions response (only the fields we read).
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Service error response body.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// HTTP reply client against an OpenAI-style chat completions endpoint.
pub struct HttpReplyService {
    config: ReplyConfig,
}

impl HttpReplyService {
    pub fn new(config: ReplyConfig) -> Self {
        Self { config }
    }

    /// System persona followed by the conversation, trimming utterance
    /// whitespace so accumulated trailing spaces don't reach the service.
    fn build_messages(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        messages.extend(history.iter().map(|m| ChatMessage {
            role: m.role.clone(),
            content: m.content.trim().to_string(),
        }));
        messages
    }
}

#[async_trait::async_trait]
impl ReplyService for HttpReplyService {
    async fn reply(&self, messages: &[ChatMessage]) -> Result<String, ReplyError> {
        if self.config.api_key.is_empty() {
            return Err(ReplyError::MissingApiKey);
        }

        let body = ChatRequest {
            model: &self.config.model,
            messages: self.build_messages(messages),
        };

        log::info!(
            "Requesting reply ({} history messages)",
            messages.len()
        );

        let response = get_http_client()
            .post(&self.config.url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ReplyError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.is_success() {
            let chat_response: ChatResponse = response
                .json()
                .await
                .map_err(|e| ReplyError::ParseError(e.to_string()))?;

            let text = chat_response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();

            if text.trim().is_empty() {
                return Err(ReplyError::EmptyReply);
            }

            log::info!("Reply received: {} chars", text.len());
            Ok(text)
        } else {
            let error_text = response.text().await.unwrap_or_default();

            let message =
                if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                    error_response.error.message
                } else {
                    error_text
                };

            log::error!("Reply service error ({}): {}", status.as_u16(), message);

            Err(ReplyError::ApiError {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_missing_key() {
        let err = ReplyError::MissingApiKey;
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn error_display_api_error() {
        let err = ReplyError::ApiError {
            status: 401,
            message: "Invalid API key".to_string(),
        };
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("Invalid API key"));
    }

    #[test]
    fn build_messages_prepends_system_prompt() {
        let service = HttpReplyService::new(ReplyConfig::new("sk-test"));
        let history = vec![
            ChatMessage::user("Book a table for two tonight "),
            ChatMessage::assistant("Done, table booked for 8pm"),
            ChatMessage::user("Thanks "),
        ];

        let messages = service.build_messages(&history);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        // Accumulated trailing spaces are trimmed for the wire
        assert_eq!(messages[1].content, "Book a table for two tonight");
        assert_eq!(messages[3].content, "Thanks");
    }

    #[test]
    fn chat_response_parses_content() {
        let json = r#"{
            "choices": [
                { "message": { "role": "assistant", "content": "Done, table booked for 8pm" } }
            ]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("Done, table booked for 8pm")
        );
    }

    #[test]
    fn chat_response_tolerates_null_content() {
        let json = r#"{ "choices": [ { "message": { "role": "assistant", "content": null } } ] }"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[tokio::test]
    async fn missing_api_key_short_circuits() {
        let service = HttpReplyService::new(ReplyConfig::new(""));
        let result = service.reply(&[ChatMessage::user("hi")]).await;
        assert!(matches!(result, Err(ReplyError::MissingApiKey)));
    }
}
