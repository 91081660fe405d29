//! HTTP request handlers.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::Stream;

use super::server::AppState;
use super::types::{
    CancelResponse, CreateTurnRequest, DeleteResponse, ProvidersResponse, TranscriptResponse,
};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::ledger::{ConversationId, TurnId, TurnOutcome};
use crate::registry::HealthStatus;
use crate::stream::{StreamEvent, Subscription};

/// Response header: id of the turn being streamed.
pub const TURN_ID_HEADER: &str = "x-chatrelay-turn-id";
/// Response header: conversation the turn belongs to.
pub const CONVERSATION_ID_HEADER: &str = "x-chatrelay-conversation-id";

/// Cancels a turn when the client that started it goes away before the
/// stream finished.
struct DisconnectGuard {
    gateway: Gateway,
    turn_id: TurnId,
    armed: bool,
}

impl DisconnectGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed && self.gateway.cancel(self.turn_id) {
            tracing::info!(turn_id = %self.turn_id, "Client disconnected, turn cancelled");
        }
    }
}

fn parse_turn_id(raw: &str) -> Result<TurnId> {
    TurnId::parse(raw).ok_or_else(|| Error::BadRequest(format!("invalid turn id '{}'", raw)))
}

fn sse_event(name: &str, data: serde_json::Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

/// Map a multiplexer event to its SSE form.
fn to_sse(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Fragment { seq, text } => sse_event(
            "fragment",
            serde_json::json!({ "seq": seq, "text": text }),
        )
        .id(seq.to_string()),
        StreamEvent::Closed {
            outcome: TurnOutcome::Failed { reason },
        } => sse_event(
            "error",
            serde_json::json!({ "status": "failed", "reason": reason }),
        ),
        StreamEvent::Closed { outcome } => {
            sse_event("done", serde_json::to_value(&outcome).unwrap_or_default())
        }
        StreamEvent::SlowConsumer => {
            let err = Error::SlowConsumer;
            sse_event(
                "error",
                serde_json::json!({ "type": err.code(), "message": err.to_string() }),
            )
        }
    }
}

/// SSE body for one subscriber: a `turn` event, then the subscription's
/// events up to and including the first terminal one.
fn event_stream(
    conversation_id: Option<ConversationId>,
    turn_id: TurnId,
    mut subscription: Subscription,
    mut guard: Option<DisconnectGuard>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(sse_event(
            "turn",
            serde_json::json!({ "turn_id": turn_id, "conversation_id": conversation_id }),
        ));

        while let Some(event) = subscription.next().await {
            let terminal = !matches!(event, StreamEvent::Fragment { .. });
            if terminal {
                if let Some(guard) = guard.as_mut() {
                    guard.disarm();
                }
            }
            yield Ok(to_sse(event));
            if terminal {
                break;
            }
        }
        drop(guard);
    }
}

fn with_turn_headers(
    mut response: Response,
    turn_id: TurnId,
    conversation_id: Option<&ConversationId>,
) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&turn_id.to_string()) {
        headers.insert(TURN_ID_HEADER, value);
    }
    if let Some(Ok(value)) = conversation_id.map(|c| HeaderValue::from_str(c.as_str())) {
        headers.insert(CONVERSATION_ID_HEADER, value);
    }
    response
}

/// Handle POST /v1/conversations/:id/turns
pub async fn create_turn(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<CreateTurnRequest>,
) -> Result<Response> {
    let conversation_id = ConversationId::from(conversation_id);
    let handle = state
        .gateway
        .start_turn(body.into_turn_request(conversation_id.clone()))
        .await?;

    let turn_id = handle.turn.id;
    let guard = state
        .config
        .gateway
        .cancel_on_disconnect
        .then(|| DisconnectGuard {
            gateway: state.gateway.clone(),
            turn_id,
            armed: true,
        });

    let stream = event_stream(
        Some(conversation_id.clone()),
        turn_id,
        handle.subscription,
        guard,
    );
    let response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    Ok(with_turn_headers(response, turn_id, Some(&conversation_id)))
}

/// Handle GET /v1/turns/:turn_id/stream - resume a turn's stream
pub async fn resume_stream(
    State(state): State<AppState>,
    Path(turn_id): Path<String>,
) -> Result<Response> {
    let turn_id = parse_turn_id(&turn_id)?;
    let subscription = state.gateway.subscribe(turn_id)?;

    tracing::debug!(turn_id = %turn_id, "Stream resumed");
    let stream = event_stream(None, turn_id, subscription, None);
    let response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    Ok(with_turn_headers(response, turn_id, None))
}

/// Handle POST /v1/turns/:turn_id/cancel
pub async fn cancel_turn(
    State(state): State<AppState>,
    Path(turn_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    let turn_id = parse_turn_id(&turn_id)?;
    let cancelled = state.gateway.cancel(turn_id);
    Ok(Json(CancelResponse { turn_id, cancelled }))
}

/// Handle GET /v1/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<TranscriptResponse>> {
    let conversation_id = ConversationId::from(conversation_id);
    let turns = state.gateway.transcript(&conversation_id).await?;
    let active_turn = turns
        .iter()
        .find(|t| !t.status.is_terminal())
        .map(|t| t.id);

    Ok(Json(TranscriptResponse {
        conversation_id,
        active_turn,
        turns,
    }))
}

/// Handle DELETE /v1/conversations/:id
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let conversation_id = ConversationId::from(conversation_id);
    let deleted_turns = state.gateway.delete_conversation(&conversation_id).await?;
    Ok(Json(DeleteResponse {
        conversation_id,
        deleted_turns,
    }))
}

/// Handle GET /providers
pub async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.gateway.providers(),
    })
}

/// Handle GET /health
///
/// 503 when every configured provider is unreachable, "degraded" when some
/// are failing.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.gateway.providers();
    let count = |status: HealthStatus| providers.iter().filter(|p| p.health == status).count();
    let healthy = count(HealthStatus::Healthy);
    let degraded = count(HealthStatus::Degraded);
    let unreachable = count(HealthStatus::Unreachable);

    let (status_code, status) = if !providers.is_empty() && healthy + degraded == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else if degraded + unreachable > 0 {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        status_code,
        Json(serde_json::json!({
            "status": status,
            "service": "chatrelay",
            "providers": {
                "healthy": healthy,
                "degraded": degraded,
                "unreachable": unreachable,
            },
            "active_turns": state.gateway.active_turns(),
        })),
    )
}
