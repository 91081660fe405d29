//! OpenAI-compatible chat completions adapter.
//!
//! Works against hosted APIs and against local inference servers that expose
//! the same `/chat/completions` SSE protocol (llama.cpp, vLLM, Ollama).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;

use super::sse::{SseDecoder, SseItem};
use super::{
    AdapterError, ChatMessage, Fragment, FragmentStream, GenerationParams, Prompt,
    ProviderAdapter,
};
use crate::config::{ApiKey, ProviderConfig};

/// Wire format of a streaming chat completion request.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
}

fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

/// Adapter for one OpenAI-compatible endpoint.
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    api_key: Option<ApiKey>,
    default_model: Option<String>,
    timeout: Option<Duration>,
    client: Client,
}

impl OpenAiAdapter {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            default_model: None,
            timeout: None,
            client,
        }
    }

    /// Build an adapter from a provider's configuration entry.
    ///
    /// The first configured model is used when a request does not name one.
    pub fn from_config(config: &ProviderConfig, client: Client) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.url.clone(),
            api_key: config.api_key.clone(),
            default_model: config.models.first().cloned(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            client,
        }
    }

    pub fn with_api_key(mut self, api_key: ApiKey) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Map an upstream HTTP status to the adapter error contract.
fn classify_status(status: u16, body: &str) -> AdapterError {
    let message = format!("HTTP {}: {}", status, body);
    match status {
        429 => AdapterError::RateLimited(message),
        408 | 504 => AdapterError::Timeout(message),
        400 | 413 | 422 => AdapterError::InvalidRequest(message),
        _ => AdapterError::Unreachable(message),
    }
}

/// Map a transport-level failure to the adapter error contract.
fn classify_transport(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(err.to_string())
    } else {
        AdapterError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn invoke(
        &self,
        prompt: &Prompt,
        params: &GenerationParams,
    ) -> Result<FragmentStream, AdapterError> {
        let model = params
            .model
            .as_deref()
            .or(self.default_model.as_deref())
            // A provider without a model of its own cannot serve this turn,
            // but the next one may.
            .ok_or_else(|| {
                AdapterError::Unreachable(format!("provider '{}' has no default model", self.name))
            })?;

        let body = ChatCompletionRequest {
            model,
            messages: &prompt.messages,
            stream: true,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stop: &params.stop,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        tracing::debug!(provider = %self.name, model = %model, "Invoking provider");

        let response = request.send().await.map_err(|e| {
            tracing::warn!(provider = %self.name, error = %e, "Failed to reach provider");
            classify_transport(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider = %self.name,
                status = %status,
                body = %error_body,
                "Provider returned error"
            );
            return Err(classify_status(status.as_u16(), &error_body));
        }

        let provider = self.name.clone();
        let mut bytes = Box::pin(response.bytes_stream());

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(classify_transport(e));
                        return;
                    }
                };
                for item in decoder.push(&chunk) {
                    match item {
                        SseItem::Delta(text) => yield Ok(Fragment::new(text)),
                        SseItem::Error(message) => {
                            yield Err(AdapterError::Unreachable(message));
                            return;
                        }
                    }
                }
                if decoder.is_done() {
                    return;
                }
            }

            for item in decoder.finish() {
                match item {
                    SseItem::Delta(text) => yield Ok(Fragment::new(text)),
                    SseItem::Error(message) => {
                        yield Err(AdapterError::Unreachable(message));
                        return;
                    }
                }
            }

            if !decoder.is_done() {
                tracing::warn!(provider = %provider, "Stream ended without [DONE]");
                yield Err(AdapterError::Unreachable(
                    "stream ended before completion".to_string(),
                ));
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_status(429, ""), AdapterError::RateLimited(_)));
        assert!(matches!(classify_status(504, ""), AdapterError::Timeout(_)));
        assert!(matches!(classify_status(400, ""), AdapterError::InvalidRequest(_)));
        assert!(matches!(classify_status(422, ""), AdapterError::InvalidRequest(_)));
        // Auth and server failures are specific to this provider
        assert!(matches!(classify_status(401, ""), AdapterError::Unreachable(_)));
        assert!(matches!(classify_status(503, ""), AdapterError::Unreachable(_)));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let adapter = OpenAiAdapter::new("local", "http://127.0.0.1:8081/v1/", Client::new());
        assert_eq!(adapter.endpoint(), "http://127.0.0.1:8081/v1/chat/completions");
    }

    #[test]
    fn test_request_body_omits_unset_fields() {
        let messages = vec![ChatMessage::new(super::super::Role::User, "hi")];
        let body = ChatCompletionRequest {
            model: "llama-3",
            messages: &messages,
            stream: true,
            temperature: None,
            max_tokens: Some(64),
            top_p: None,
            stop: &[],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama-3");
        assert_eq!(json["stream"], true);
        assert_eq!(json["max_tokens"], 64);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("temperature").is_none());
        assert!(json.get("stop").is_none());
    }
}
