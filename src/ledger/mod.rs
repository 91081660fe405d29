//! Session ledger: the authoritative record of every conversation.
//!
//! The ledger admits at most one in-flight assistant turn per conversation,
//! accumulates that turn's fragments in emission order, and persists it
//! through a [`TurnStore`] once it reaches a terminal status. Admission is
//! decided under the conversation's map entry; persistence and fragment
//! accumulation happen outside it.

mod store;
mod turn;

pub use store::{MemoryTurnStore, TurnStore};
pub use turn::{ConversationId, Turn, TurnId, TurnOutcome, TurnStatus};

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::provider::Fragment;

/// What currently holds a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Active(TurnId),
    Deleting,
}

pub struct SessionLedger {
    store: Arc<dyn TurnStore>,
    conversations: DashMap<ConversationId, Slot>,
    /// Non-terminal assistant turns.
    active: DashMap<TurnId, Turn>,
}

impl SessionLedger {
    pub fn new(store: Arc<dyn TurnStore>) -> Self {
        Self {
            store,
            conversations: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Admit a user message and register a pending assistant turn for it.
    ///
    /// Fails fast with [`Error::ConflictingTurn`] when the conversation
    /// already has a turn in flight. The user message is durable when this
    /// returns.
    pub async fn begin_turn(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Turn> {
        // The prompt precedes its reply in every timestamp ordering.
        let user = Turn::user(conversation_id.clone(), content);
        let assistant = Turn::assistant(conversation_id.clone());

        match self.conversations.entry(conversation_id.clone()) {
            Entry::Occupied(entry) => {
                return Err(match *entry.get() {
                    Slot::Active(active_turn) => {
                        tracing::info!(
                            conversation_id = %conversation_id,
                            active_turn = %active_turn,
                            "Turn rejected: conversation busy"
                        );
                        Error::ConflictingTurn {
                            conversation_id: conversation_id.clone(),
                            active_turn,
                        }
                    }
                    Slot::Deleting => Error::BadRequest(format!(
                        "conversation '{}' is being deleted",
                        conversation_id
                    )),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Active(assistant.id));
            }
        }
        self.active.insert(assistant.id, assistant.clone());

        if let Err(e) = self.store.append(&user).await {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "Failed to persist user message, releasing conversation"
            );
            self.active.remove(&assistant.id);
            self.release(conversation_id, assistant.id);
            return Err(e);
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            turn_id = %assistant.id,
            "Turn admitted"
        );
        Ok(assistant)
    }

    /// Record which provider is generating the turn and mark it streaming.
    pub fn mark_streaming(&self, turn_id: TurnId, provider: &str) -> Result<()> {
        let mut turn = self
            .active
            .get_mut(&turn_id)
            .ok_or(Error::UnknownTurn(turn_id))?;
        if turn.status == TurnStatus::Pending {
            turn.status = TurnStatus::Streaming;
        }
        turn.provider = Some(provider.to_string());
        Ok(())
    }

    /// Append a fragment to the turn's buffer.
    pub fn append_fragment(&self, turn_id: TurnId, fragment: &Fragment) -> Result<()> {
        let mut turn = self
            .active
            .get_mut(&turn_id)
            .ok_or(Error::UnknownTurn(turn_id))?;
        if turn.status == TurnStatus::Pending {
            turn.status = TurnStatus::Streaming;
        }
        turn.content.push_str(&fragment.text);
        Ok(())
    }

    /// Finalize a turn and persist it.
    ///
    /// The turn is durable when this returns `Ok`. A second call for the same
    /// turn fails with [`Error::UnknownTurn`]; the conversation is released
    /// even when persisting fails.
    pub async fn complete_turn(&self, turn_id: TurnId, outcome: TurnOutcome) -> Result<Turn> {
        let next = outcome.status();
        let (_, mut turn) = self
            .active
            .remove_if(&turn_id, |_, turn| turn.status.can_advance_to(next))
            .ok_or_else(|| match self.active.get(&turn_id) {
                Some(turn) => Error::InvalidTransition {
                    from: turn.status,
                    to: next,
                },
                None => Error::UnknownTurn(turn_id),
            })?;

        turn.status = next;
        turn.failure_reason = outcome.reason().map(str::to_string);
        turn.completed_at = Some(Utc::now());

        let persisted = self.store.append(&turn).await;
        self.release(&turn.conversation_id, turn_id);

        match persisted {
            Ok(()) => {
                tracing::info!(
                    conversation_id = %turn.conversation_id,
                    turn_id = %turn_id,
                    status = %turn.status,
                    provider = turn.provider.as_deref().unwrap_or("-"),
                    chars = turn.content.len(),
                    "Turn finalized"
                );
                Ok(turn)
            }
            Err(e) => {
                tracing::error!(turn_id = %turn_id, error = %e, "Failed to persist turn");
                Err(e)
            }
        }
    }

    /// Snapshot of an in-flight turn.
    pub fn turn(&self, turn_id: TurnId) -> Option<Turn> {
        self.active.get(&turn_id).map(|t| t.clone())
    }

    /// The conversation's in-flight turn, if any.
    pub fn active_turn(&self, conversation_id: &ConversationId) -> Option<Turn> {
        let turn_id = match self.conversations.get(conversation_id).map(|s| *s)? {
            Slot::Active(id) => id,
            Slot::Deleting => return None,
        };
        self.turn(turn_id)
    }

    /// Stored turns followed by the in-flight turn, if any.
    pub async fn transcript(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>> {
        let mut turns = self.store.read_all(conversation_id).await?;
        if let Some(active) = self.active_turn(conversation_id) {
            turns.push(active);
        }
        Ok(turns)
    }

    /// Delete a conversation's stored turns. Refused while a turn is in
    /// flight.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<u64> {
        match self.conversations.entry(conversation_id.clone()) {
            Entry::Occupied(entry) => {
                return Err(match *entry.get() {
                    Slot::Active(active_turn) => Error::ConflictingTurn {
                        conversation_id: conversation_id.clone(),
                        active_turn,
                    },
                    Slot::Deleting => Error::BadRequest(format!(
                        "conversation '{}' is already being deleted",
                        conversation_id
                    )),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Deleting);
            }
        }

        let result = self.store.delete(conversation_id).await;
        self.conversations
            .remove_if(conversation_id, |_, slot| *slot == Slot::Deleting);

        if let Ok(removed) = result {
            tracing::info!(conversation_id = %conversation_id, removed, "Conversation deleted");
        }
        result
    }

    fn release(&self, conversation_id: &ConversationId, turn_id: TurnId) {
        self.conversations
            .remove_if(conversation_id, |_, slot| *slot == Slot::Active(turn_id));
    }
}
