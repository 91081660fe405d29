//! Provider registry.
//!
//! Holds every configured adapter together with its routing metadata and a
//! health record. The registry is the only state shared between unrelated
//! requests; each provider's record lives behind its own mutex inside a
//! [`DashMap`], so concurrent outcome reports never lose a transition and
//! never contend across providers.

mod health;

pub use health::{HealthPolicy, HealthStatus};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::{DegradedOrdering, ProviderConfig};
use crate::provider::ProviderAdapter;
use health::HealthRecord;

/// Static routing metadata for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    /// Models served; empty means the provider accepts any model name.
    pub models: Vec<String>,
    pub context_length: Option<u32>,
    /// Capability tags (modality, locality, ...).
    pub tags: Vec<String>,
    /// Higher is preferred among providers with the same health.
    pub priority: i32,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            models: Vec::new(),
            context_length: None,
            tags: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_context_length(mut self, tokens: u32) -> Self {
        self.context_length = Some(tokens);
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

impl From<&ProviderConfig> for ProviderDescriptor {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            id: config.name.clone(),
            models: config.models.clone(),
            context_length: config.context_length,
            tags: config.tags.clone(),
            priority: config.priority,
        }
    }
}

/// What a turn needs from a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub model: Option<String>,
    /// Minimum context length; providers with an unknown context length do
    /// not satisfy it.
    pub min_context: Option<u32>,
    /// Every tag listed here must be present on the provider.
    pub tags: Vec<String>,
}

impl Requirements {
    pub fn matches(&self, descriptor: &ProviderDescriptor) -> bool {
        if let Some(model) = &self.model {
            if !descriptor.models.is_empty() && !descriptor.models.iter().any(|m| m == model) {
                return false;
            }
        }

        if let Some(min) = self.min_context {
            match descriptor.context_length {
                Some(len) if len >= min => {}
                _ => return false,
            }
        }

        self.tags.iter().all(|t| descriptor.tags.contains(t))
    }
}

impl std::fmt::Display for Requirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(model) = &self.model {
            parts.push(format!("model={}", model));
        }
        if let Some(min) = self.min_context {
            parts.push(format!("min_context={}", min));
        }
        if !self.tags.is_empty() {
            parts.push(format!("tags=[{}]", self.tags.join(",")));
        }
        if parts.is_empty() {
            write!(f, "any")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Result of one provider invocation, as reported by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

/// A routable provider as returned by [`ProviderRegistry::list_candidates`].
#[derive(Clone)]
pub struct Candidate {
    pub descriptor: ProviderDescriptor,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub latency: Option<Duration>,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("id", &self.descriptor.id)
            .field("health", &self.health)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("latency", &self.latency)
            .finish()
    }
}

/// Point-in-time view of one provider, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub latency_ms: Option<u64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct ProviderEntry {
    descriptor: ProviderDescriptor,
    adapter: Arc<dyn ProviderAdapter>,
    /// Registration order, the final tie-breaker.
    seq: usize,
    health: Mutex<HealthRecord>,
}

/// Concurrent registry with one health record per provider.
pub struct ProviderRegistry {
    entries: DashMap<String, ProviderEntry>,
    next_seq: AtomicUsize,
    policy: HealthPolicy,
    degraded_ordering: DegradedOrdering,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(HealthPolicy::default(), DegradedOrdering::default())
    }
}

impl ProviderRegistry {
    pub fn new(policy: HealthPolicy, degraded_ordering: DegradedOrdering) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicUsize::new(0),
            policy,
            degraded_ordering,
        }
    }

    /// Register a provider. Re-registering an id replaces the adapter and
    /// resets its health.
    pub fn register(&self, descriptor: ProviderDescriptor, adapter: Arc<dyn ProviderAdapter>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = descriptor.id.clone();

        tracing::info!(
            provider = %id,
            priority = descriptor.priority,
            models = ?descriptor.models,
            tags = ?descriptor.tags,
            "Registered provider"
        );

        let previous = self.entries.insert(
            id.clone(),
            ProviderEntry {
                descriptor,
                adapter,
                seq,
                health: Mutex::new(HealthRecord::new()),
            },
        );
        if previous.is_some() {
            tracing::warn!(provider = %id, "Provider re-registered, health reset");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered candidates for a request.
    ///
    /// Healthy providers come first (priority descending, then observed
    /// latency ascending, then registration order), degraded providers next.
    /// Unreachable providers appear only when nothing else matches.
    pub fn list_candidates(&self, requirements: &Requirements) -> Vec<Candidate> {
        let mut ranked: Vec<(usize, Candidate)> = self
            .entries
            .iter()
            .filter(|entry| requirements.matches(&entry.value().descriptor))
            .map(|entry| {
                let provider = entry.value();
                let mut health = provider.health.lock().unwrap();
                health.refresh(&provider.descriptor.id, &self.policy);
                (
                    provider.seq,
                    Candidate {
                        descriptor: provider.descriptor.clone(),
                        adapter: provider.adapter.clone(),
                        health: health.status,
                        consecutive_failures: health.consecutive_failures,
                        latency: health.latency,
                    },
                )
            })
            .collect();

        let ordering = self.degraded_ordering;
        ranked.sort_by(|(seq_a, a), (seq_b, b)| {
            let by_health = a.health.rank().cmp(&b.health.rank());
            let by_failures = if a.health == HealthStatus::Degraded
                && b.health == HealthStatus::Degraded
                && ordering == DegradedOrdering::FewestFailures
            {
                a.consecutive_failures.cmp(&b.consecutive_failures)
            } else {
                std::cmp::Ordering::Equal
            };
            by_health
                .then(by_failures)
                .then(b.descriptor.priority.cmp(&a.descriptor.priority))
                .then(
                    a.latency
                        .unwrap_or(Duration::ZERO)
                        .cmp(&b.latency.unwrap_or(Duration::ZERO)),
                )
                .then(seq_a.cmp(seq_b))
        });

        let has_routable = ranked
            .iter()
            .any(|(_, c)| c.health != HealthStatus::Unreachable);
        if has_routable {
            ranked.retain(|(_, c)| c.health != HealthStatus::Unreachable);
        } else if !ranked.is_empty() {
            tracing::warn!(
                requirements = %requirements,
                "Only unreachable providers match, using them as last resort"
            );
        }

        ranked.into_iter().map(|(_, c)| c).collect()
    }

    /// Record the outcome of an invocation. Visible to the next
    /// `list_candidates` call immediately.
    pub fn report_outcome(&self, provider_id: &str, outcome: Outcome, latency: Option<Duration>) {
        let Some(entry) = self.entries.get(provider_id) else {
            tracing::debug!(provider = %provider_id, "Outcome for unknown provider ignored");
            return;
        };
        let mut health = entry.value().health.lock().unwrap();
        match outcome {
            Outcome::Success => health.record_success(provider_id, latency),
            Outcome::Failure { reason } => {
                health.record_failure(provider_id, &self.policy, &reason)
            }
        }
    }

    /// Current health of one provider.
    pub fn health(&self, provider_id: &str) -> Option<HealthStatus> {
        self.entries.get(provider_id).map(|entry| {
            let mut health = entry.value().health.lock().unwrap();
            health.refresh(provider_id, &self.policy);
            health.status
        })
    }

    /// Snapshot of every provider, in registration order.
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        let mut snapshots: Vec<(usize, ProviderSnapshot)> = self
            .entries
            .iter()
            .map(|entry| {
                let provider = entry.value();
                let mut health = provider.health.lock().unwrap();
                health.refresh(&provider.descriptor.id, &self.policy);
                (
                    provider.seq,
                    ProviderSnapshot {
                        descriptor: provider.descriptor.clone(),
                        health: health.status,
                        consecutive_failures: health.consecutive_failures,
                        total_failures: health.total_failures,
                        total_successes: health.total_successes,
                        latency_ms: health.latency.map(|l| l.as_millis() as u64),
                        last_checked: health.last_checked,
                        last_error: health.last_error.clone(),
                    },
                )
            })
            .collect();
        snapshots.sort_by_key(|(seq, _)| *seq);
        snapshots.into_iter().map(|(_, s)| s).collect()
    }
}
