//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chatrelay::config::GatewayConfig;
use chatrelay::ledger::{MemoryTurnStore, TurnStore};
use chatrelay::provider::{
    AdapterError, Fragment, FragmentStream, GenerationParams, Prompt, ProviderAdapter,
};
use chatrelay::registry::{ProviderDescriptor, ProviderRegistry};
use chatrelay::stream::{StreamEvent, Subscription};
use chatrelay::Gateway;

#[derive(Clone)]
enum Step {
    Emit(String),
    Fail(AdapterError),
}

/// Adapter that plays back a fixed script.
pub struct ScriptedAdapter {
    invoke_error: Option<AdapterError>,
    steps: Vec<Step>,
    /// Wait before each fragment.
    delay: Option<Duration>,
    /// Never finish after the scripted steps.
    hang: bool,
    calls: AtomicU32,
    dropped: Arc<AtomicBool>,
    last_prompt: std::sync::Mutex<Option<Prompt>>,
}

impl ScriptedAdapter {
    fn with_steps(steps: Vec<Step>) -> Self {
        Self {
            invoke_error: None,
            steps,
            delay: None,
            hang: false,
            calls: AtomicU32::new(0),
            dropped: Arc::new(AtomicBool::new(false)),
            last_prompt: std::sync::Mutex::new(None),
        }
    }

    pub fn emitting(fragments: &[&str]) -> Self {
        Self::with_steps(
            fragments
                .iter()
                .map(|t| Step::Emit(t.to_string()))
                .collect(),
        )
    }

    /// Fails the invocation itself.
    pub fn failing(error: AdapterError) -> Self {
        let mut adapter = Self::with_steps(Vec::new());
        adapter.invoke_error = Some(error);
        adapter
    }

    pub fn then_fail(mut self, error: AdapterError) -> Self {
        self.steps.push(Step::Fail(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether the most recent stream has been dropped.
    pub fn stream_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.last_prompt.lock().unwrap().clone()
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        prompt: &Prompt,
        _params: &GenerationParams,
    ) -> Result<FragmentStream, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.clone());
        if let Some(err) = &self.invoke_error {
            return Err(err.clone());
        }

        self.dropped.store(false, Ordering::SeqCst);
        let flag = DropFlag(self.dropped.clone());
        let steps = self.steps.clone();
        let delay = self.delay;
        let hang = self.hang;

        Ok(Box::pin(async_stream::stream! {
            let _flag = flag;
            for step in steps {
                match step {
                    Step::Emit(text) => {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        yield Ok(Fragment::new(text));
                    }
                    Step::Fail(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
            if hang {
                futures::future::pending::<()>().await;
            }
        }))
    }
}

pub fn unreachable() -> AdapterError {
    AdapterError::Unreachable("connection refused".to_string())
}

/// Gateway over an in-memory store with the given adapters registered in
/// order.
pub fn gateway_with(
    adapters: Vec<(&str, Arc<ScriptedAdapter>)>,
    config: GatewayConfig,
) -> (Gateway, Arc<ProviderRegistry>, Arc<MemoryTurnStore>) {
    let registry = Arc::new(ProviderRegistry::default());
    for (id, adapter) in adapters {
        registry.register(ProviderDescriptor::new(id), adapter);
    }
    let store = Arc::new(MemoryTurnStore::new());
    let gateway = Gateway::from_config(
        &config,
        registry.clone(),
        store.clone() as Arc<dyn TurnStore>,
    );
    (gateway, registry, store)
}

pub fn gateway(
    adapters: Vec<(&str, Arc<ScriptedAdapter>)>,
) -> (Gateway, Arc<ProviderRegistry>, Arc<MemoryTurnStore>) {
    gateway_with(adapters, GatewayConfig::default())
}

/// Read a subscription until it ends, returning the concatenated text and
/// the final non-fragment event.
pub async fn collect(subscription: &mut Subscription) -> (String, Option<StreamEvent>) {
    let mut text = String::new();
    while let Some(event) = subscription.next().await {
        match event {
            StreamEvent::Fragment { text: t, .. } => text.push_str(&t),
            other => return (text, Some(other)),
        }
    }
    (text, None)
}
