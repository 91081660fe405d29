//! Error types for chatrelay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::ledger::{ConversationId, TurnId, TurnStatus};

/// Result type alias for chatrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chatrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("A response is already in progress for conversation '{conversation_id}' (turn {active_turn})")]
    ConflictingTurn {
        conversation_id: ConversationId,
        active_turn: TurnId,
    },

    #[error("No providers match requirements: {requirements}")]
    NoProviders { requirements: String },

    #[error("All {attempted} provider attempts failed: {summary}")]
    RoutingExhausted { attempted: usize, summary: String },

    #[error("Provider '{provider}' failed mid-stream: {reason}")]
    PartialFailure { provider: String, reason: String },

    #[error("Subscriber could not keep up with the stream and was disconnected")]
    SlowConsumer,

    #[error("Turn was cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Turn {0} is not active")]
    UnknownTurn(TurnId),

    #[error("No stream session for turn {0}")]
    UnknownStream(TurnId),

    #[error("Illegal turn transition from {from} to {to}")]
    InvalidTransition { from: TurnStatus, to: TurnStatus },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    /// Short machine-readable code used in JSON bodies and SSE error events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::ConflictingTurn { .. } => "conflicting_turn",
            Error::NoProviders { .. } => "no_providers",
            Error::RoutingExhausted { .. } => "routing_exhausted",
            Error::PartialFailure { .. } => "partial_failure",
            Error::SlowConsumer => "slow_consumer",
            Error::Cancelled => "cancelled",
            Error::InvalidRequest(_) => "invalid_request",
            Error::BadRequest(_) => "bad_request",
            Error::UnknownTurn(_) => "unknown_turn",
            Error::UnknownStream(_) => "unknown_stream",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Internal(_) => "internal_error",
            Error::Database(_) => "database_error",
            Error::Migrate(_) => "database_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::ConflictingTurn { .. } => StatusCode::CONFLICT,
            Error::NoProviders { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::RoutingExhausted { .. } => StatusCode::BAD_GATEWAY,
            Error::PartialFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::SlowConsumer => StatusCode::TOO_MANY_REQUESTS,
            Error::Cancelled => StatusCode::CONFLICT,
            Error::InvalidRequest(_) | Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::UnknownTurn(_) | Error::UnknownStream(_) => StatusCode::NOT_FOUND,
            Error::Config(_)
            | Error::InvalidTransition { .. }
            | Error::Internal(_)
            | Error::Database(_)
            | Error::Migrate(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.code(),
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_409() {
        let err = Error::ConflictingTurn {
            conversation_id: ConversationId::from("conv-1"),
            active_turn: TurnId::new(),
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "conflicting_turn");
        assert!(err.to_string().contains("already in progress"));
    }

    #[test]
    fn test_unknown_turn_maps_to_404() {
        let err = Error::UnknownTurn(TurnId::new());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
