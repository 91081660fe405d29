//! Turn orchestration.
//!
//! The gateway ties the other components together for each request: the
//! ledger admits the turn, the multiplexer opens its stream, the router
//! picks a provider, and a spawned relay task moves every fragment into the
//! ledger and then out to subscribers. The relay is the only place a turn's
//! terminal status is decided, and it persists that status before any
//! subscriber is told the turn is over.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::ledger::{
    ConversationId, SessionLedger, Turn, TurnId, TurnOutcome, TurnStatus, TurnStore,
};
use crate::provider::{ChatMessage, GenerationParams, Prompt, Role};
use crate::registry::{ProviderRegistry, ProviderSnapshot, Requirements};
use crate::router::{format_attempts, Router};
use crate::stream::{Multiplexer, Publisher, Subscription};

/// A user message and how it should be answered.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub params: GenerationParams,
    pub requirements: Requirements,
    /// Prepended to the prompt; not stored in the transcript.
    pub system_prompt: Option<String>,
}

impl TurnRequest {
    pub fn new(conversation_id: impl Into<ConversationId>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            params: GenerationParams::default(),
            requirements: Requirements::default(),
            system_prompt: None,
        }
    }
}

/// Handle returned to whoever started a turn.
pub struct TurnHandle {
    /// The pending assistant turn.
    pub turn: Turn,
    /// Subscription owned by the originating client.
    pub subscription: Subscription,
    pub cancel: CancellationToken,
    /// Resolves to the finalized (and persisted) turn.
    pub completion: JoinHandle<Result<Turn>>,
}

#[derive(Clone)]
pub struct Gateway {
    ledger: Arc<SessionLedger>,
    router: Router,
    multiplexer: Multiplexer,
    registry: Arc<ProviderRegistry>,
    cancels: Arc<DashMap<TurnId, CancellationToken>>,
}

impl Gateway {
    pub fn new(ledger: Arc<SessionLedger>, router: Router, multiplexer: Multiplexer) -> Self {
        let registry = router.registry().clone();
        Self {
            ledger,
            router,
            multiplexer,
            registry,
            cancels: Arc::new(DashMap::new()),
        }
    }

    /// Wire up a gateway from configuration, a populated registry and a
    /// turn store.
    pub fn from_config(
        config: &GatewayConfig,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn TurnStore>,
    ) -> Self {
        Self::new(
            Arc::new(SessionLedger::new(store)),
            Router::from_config(registry, config),
            Multiplexer::new(config.subscriber_queue, config.replay_buffer),
        )
    }

    /// Admit a user message and start generating the reply.
    ///
    /// Fails with [`Error::ConflictingTurn`] when the conversation already
    /// has a reply in flight. Routing failures do not fail this call; they
    /// end the turn as `failed` and are reported on the stream.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<TurnHandle> {
        if request.content.trim().is_empty() {
            return Err(Error::BadRequest("message content is empty".to_string()));
        }

        let turn = self
            .ledger
            .begin_turn(&request.conversation_id, &request.content)
            .await?;

        let publisher = match self.multiplexer.open(turn.id) {
            Ok(publisher) => publisher,
            Err(e) => {
                let _ = self
                    .ledger
                    .complete_turn(
                        turn.id,
                        TurnOutcome::Failed {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                return Err(e);
            }
        };
        let subscription = self.multiplexer.subscribe(turn.id)?;

        let cancel = CancellationToken::new();
        self.cancels.insert(turn.id, cancel.clone());

        tracing::info!(
            conversation_id = %turn.conversation_id,
            turn_id = %turn.id,
            requirements = %request.requirements,
            "Turn started"
        );

        let gateway = self.clone();
        let completion = tokio::spawn({
            let cancel = cancel.clone();
            let turn = turn.clone();
            async move { gateway.relay(turn, request, publisher, cancel).await }
        });

        Ok(TurnHandle {
            turn,
            subscription,
            cancel,
            completion,
        })
    }

    /// Attach to a turn's stream (replay plus live).
    pub fn subscribe(&self, turn_id: TurnId) -> Result<Subscription> {
        self.multiplexer.subscribe(turn_id)
    }

    /// Request cancellation. Returns whether the turn was still running;
    /// cancelling an unknown or finished turn is not an error.
    pub fn cancel(&self, turn_id: TurnId) -> bool {
        match self.cancels.get(&turn_id) {
            Some(token) => {
                if !token.is_cancelled() {
                    tracing::info!(turn_id = %turn_id, "Turn cancellation requested");
                    token.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub async fn transcript(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>> {
        self.ledger.transcript(conversation_id).await
    }

    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<u64> {
        self.ledger.delete_conversation(conversation_id).await
    }

    pub fn providers(&self) -> Vec<ProviderSnapshot> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Number of turns currently being generated.
    pub fn active_turns(&self) -> usize {
        self.cancels.len()
    }

    async fn relay(
        self,
        turn: Turn,
        request: TurnRequest,
        publisher: Publisher,
        cancel: CancellationToken,
    ) -> Result<Turn> {
        let turn_id = turn.id;
        let outcome = self.generate(&turn, &request, &publisher, &cancel).await;

        let finalized = self.ledger.complete_turn(turn_id, outcome.clone()).await;
        let announced = match &finalized {
            Ok(_) => outcome,
            Err(e) => TurnOutcome::Failed {
                reason: format!("turn could not be saved: {}", e),
            },
        };
        publisher.close(announced);
        self.cancels.remove(&turn_id);

        finalized
    }

    /// Run the turn to its outcome. Never returns early without one.
    async fn generate(
        &self,
        turn: &Turn,
        request: &TurnRequest,
        publisher: &Publisher,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let turn_id = turn.id;

        let prompt = match self.ledger.transcript(&turn.conversation_id).await {
            Ok(history) => build_prompt(&history, request.system_prompt.as_deref()),
            Err(e) => return failed(turn_id, e),
        };

        let dispatch = match self
            .router
            .dispatch(&prompt, &request.params, &request.requirements, cancel)
            .await
        {
            Ok(dispatch) => dispatch,
            Err(Error::Cancelled) => return TurnOutcome::Cancelled,
            Err(e) => return failed(turn_id, e),
        };

        tracing::debug!(
            turn_id = %turn_id,
            provider = %dispatch.provider,
            attempts = %format_attempts(&dispatch.attempts).unwrap_or_else(|| "-".to_string()),
            "Provider committed"
        );
        if let Err(e) = self.ledger.mark_streaming(turn_id, &dispatch.provider) {
            return failed(turn_id, e);
        }

        let mut stream = dispatch.stream;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(turn_id = %turn_id, "Turn cancelled mid-stream");
                    return TurnOutcome::Cancelled;
                }
                item = stream.next() => match item {
                    Some(Ok(fragment)) => {
                        // Ledger first: a subscriber never sees text the ledger lacks.
                        if let Err(e) = self.ledger.append_fragment(turn_id, &fragment) {
                            return failed(turn_id, e);
                        }
                        if let Err(e) = publisher.publish(&fragment) {
                            tracing::warn!(turn_id = %turn_id, error = %e, "Publish failed");
                        }
                    }
                    Some(Err(e)) => return failed(turn_id, e),
                    None => return TurnOutcome::Complete,
                }
            }
        }
    }
}

fn failed(turn_id: TurnId, error: Error) -> TurnOutcome {
    tracing::warn!(turn_id = %turn_id, code = error.code(), error = %error, "Turn failed");
    TurnOutcome::Failed {
        reason: error.to_string(),
    }
}

/// Turn a conversation's history into a provider prompt.
///
/// Only finished messages are included; partial or failed replies are
/// left out.
fn build_prompt(history: &[Turn], system_prompt: Option<&str>) -> Prompt {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::new(Role::System, system));
    }
    messages.extend(
        history
            .iter()
            .filter(|t| t.status == TurnStatus::Complete)
            .map(|t| ChatMessage::new(t.role, t.content.clone())),
    );
    Prompt { messages }
}
