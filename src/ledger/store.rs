//! Durable turn storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::turn::{ConversationId, Turn};
use crate::error::Result;

/// Append-only store of finished turns, keyed by conversation.
///
/// `append` must not return until the turn is durable.
#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn append(&self, turn: &Turn) -> Result<()>;

    /// All turns of a conversation in append order.
    async fn read_all(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>>;

    /// Remove a conversation. Returns the number of turns removed.
    async fn delete(&self, conversation_id: &ConversationId) -> Result<u64>;
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryTurnStore {
    turns: Mutex<HashMap<ConversationId, Vec<Turn>>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn append(&self, turn: &Turn) -> Result<()> {
        self.turns
            .lock()
            .unwrap()
            .entry(turn.conversation_id.clone())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn read_all(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>> {
        Ok(self
            .turns
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, conversation_id: &ConversationId) -> Result<u64> {
        Ok(self
            .turns
            .lock()
            .unwrap()
            .remove(conversation_id)
            .map(|turns| turns.len() as u64)
            .unwrap_or(0))
    }
}
