//! Turn identity and lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Role;

/// Client-chosen conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned turn identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a turn. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnStatus::Complete | TurnStatus::Failed | TurnStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// A pending turn may skip streaming when it fails or is cancelled
    /// before any output (or completes with none).
    pub fn can_advance_to(&self, next: TurnStatus) -> bool {
        match self {
            TurnStatus::Pending => next != TurnStatus::Pending,
            TurnStatus::Streaming => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Streaming => "streaming",
            TurnStatus::Complete => "complete",
            TurnStatus::Failed => "failed",
            TurnStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TurnStatus::Pending),
            "streaming" => Some(TurnStatus::Streaming),
            "complete" => Some(TurnStatus::Complete),
            "failed" => Some(TurnStatus::Failed),
            "cancelled" => Some(TurnStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TurnOutcome {
    Complete,
    Failed { reason: String },
    Cancelled,
}

impl TurnOutcome {
    pub fn status(&self) -> TurnStatus {
        match self {
            TurnOutcome::Complete => TurnStatus::Complete,
            TurnOutcome::Failed { .. } => TurnStatus::Failed,
            TurnOutcome::Cancelled => TurnStatus::Cancelled,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TurnOutcome::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// One message in a conversation: a user prompt or an assistant response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    /// Provider that produced an assistant turn.
    pub provider: Option<String>,
    pub status: TurnStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Turn {
    /// A user message; complete as soon as it is recorded.
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TurnId::new(),
            conversation_id,
            role: Role::User,
            content: content.into(),
            provider: None,
            status: TurnStatus::Complete,
            failure_reason: None,
            created_at: now,
            completed_at: Some(now),
        }
    }

    /// A pending assistant response.
    pub fn assistant(conversation_id: ConversationId) -> Self {
        Self {
            id: TurnId::new(),
            conversation_id,
            role: Role::Assistant,
            content: String::new(),
            provider: None,
            status: TurnStatus::Pending,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
