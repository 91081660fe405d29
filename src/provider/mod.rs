//! Provider adapter contract.
//!
//! Every backend (hosted API or local inference server) is reached through
//! [`ProviderAdapter`]. An adapter turns a prompt into a lazy stream of
//! [`Fragment`]s and reports failures with one of four [`AdapterError`] kinds.

pub mod openai;
mod sse;

pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The conversation context sent to a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    /// Text of the last user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// An incremental unit of generated output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
}

impl Fragment {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// The fixed set of ways an adapter can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AdapterError {
    /// Short category name used in logs and attempt summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Unreachable(_) => "unreachable",
            AdapterError::Timeout(_) => "timeout",
            AdapterError::RateLimited(_) => "rate_limited",
            AdapterError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether another provider might succeed where this one failed.
    ///
    /// An invalid request will be rejected everywhere, so it is neither
    /// retried nor charged against the provider's health.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AdapterError::InvalidRequest(_))
    }
}

/// Lazy, finite sequence of fragments produced by one invocation.
pub type FragmentStream = BoxStream<'static, Result<Fragment, AdapterError>>;

/// Uniform interface to one LLM backend.
///
/// Dropping the returned stream must release any upstream resources
/// (connections, GPU slots); this is how cancellation reaches the backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn invoke(
        &self,
        prompt: &Prompt,
        params: &GenerationParams,
    ) -> Result<FragmentStream, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_not_retryable() {
        assert!(!AdapterError::InvalidRequest("bad".into()).is_retryable());
        assert!(AdapterError::Unreachable("down".into()).is_retryable());
        assert!(AdapterError::Timeout("slow".into()).is_retryable());
        assert!(AdapterError::RateLimited("429".into()).is_retryable());
    }

    #[test]
    fn test_role_parse_round_trip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn test_last_user_message() {
        let prompt = Prompt {
            messages: vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "first"),
                ChatMessage::new(Role::Assistant, "reply"),
                ChatMessage::new(Role::User, "second"),
            ],
        };
        assert_eq!(prompt.last_user_message(), Some("second"));
    }
}
