//! Request and response bodies.

use serde::{Deserialize, Serialize};

use crate::gateway::TurnRequest;
use crate::ledger::{ConversationId, Turn, TurnId};
use crate::provider::GenerationParams;
use crate::registry::{ProviderSnapshot, Requirements};

/// Body of `POST /v1/conversations/:id/turns`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTurnRequest {
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    /// Only route to providers with at least this context length.
    #[serde(default)]
    pub min_context: Option<u32>,
    /// Only route to providers carrying all of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub system: Option<String>,
}

impl CreateTurnRequest {
    pub fn into_turn_request(self, conversation_id: ConversationId) -> TurnRequest {
        TurnRequest {
            conversation_id,
            content: self.content,
            requirements: Requirements {
                model: self.model.clone(),
                min_context: self.min_context,
                tags: self.tags,
            },
            params: GenerationParams {
                model: self.model,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                top_p: self.top_p,
                stop: self.stop,
            },
            system_prompt: self.system,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub conversation_id: ConversationId,
    pub active_turn: Option<TurnId>,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub turn_id: TurnId,
    /// False when the turn had already finished (or never existed).
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub conversation_id: ConversationId,
    pub deleted_turns: u64,
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_feeds_both_params_and_requirements() {
        let body: CreateTurnRequest = serde_json::from_value(serde_json::json!({
            "content": "hi",
            "model": "llama-3-8b",
            "max_tokens": 128,
            "tags": ["local"]
        }))
        .unwrap();

        let request = body.into_turn_request(ConversationId::from("c1"));
        assert_eq!(request.params.model.as_deref(), Some("llama-3-8b"));
        assert_eq!(request.requirements.model.as_deref(), Some("llama-3-8b"));
        assert_eq!(request.params.max_tokens, Some(128));
        assert_eq!(request.requirements.tags, vec!["local".to_string()]);
        assert!(request.system_prompt.is_none());
    }

    #[test]
    fn test_minimal_body() {
        let body: CreateTurnRequest =
            serde_json::from_value(serde_json::json!({ "content": "hi" })).unwrap();
        let request = body.into_turn_request(ConversationId::from("c1"));
        assert_eq!(request.requirements, Requirements::default());
        assert_eq!(request.params, GenerationParams::default());
    }
}
