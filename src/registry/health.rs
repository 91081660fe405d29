//! Per-provider health state machine.
//!
//! Implements the Healthy -> Degraded -> Unreachable lifecycle:
//! - **Healthy**: consecutive failures are counted; reaching the threshold degrades
//! - **Degraded**: still routable, behind healthy providers; one more failure
//!   makes the provider unreachable
//! - **Unreachable**: only used as a last resort; optionally re-admitted as
//!   degraded after a cooldown
//!
//! Any success returns the provider to Healthy and resets the counter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Weight of the newest sample in the latency moving average.
const LATENCY_SMOOTHING: f64 = 0.3;

/// The three health states of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        }
    }

    /// Ordering rank for candidate lists (lower routes first).
    pub(crate) fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unreachable => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds governing health transitions.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Consecutive failures that move Healthy to Degraded.
    pub degraded_after: u32,
    /// Time after which an Unreachable provider is re-admitted as Degraded.
    pub unreachable_cooldown: Option<Duration>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            unreachable_cooldown: None,
        }
    }
}

impl From<&crate::config::HealthConfig> for HealthPolicy {
    fn from(config: &crate::config::HealthConfig) -> Self {
        Self {
            degraded_after: config.degraded_after,
            unreachable_cooldown: config.unreachable_cooldown_secs.map(Duration::from_secs),
        }
    }
}

/// Health record for one provider (not thread-safe on its own; the registry
/// keeps each record behind its own mutex).
#[derive(Debug)]
pub(crate) struct HealthRecord {
    pub(crate) status: HealthStatus,
    pub(crate) consecutive_failures: u32,
    pub(crate) total_failures: u64,
    pub(crate) total_successes: u64,
    /// Smoothed latency to first fragment.
    pub(crate) latency: Option<Duration>,
    pub(crate) last_checked: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
    /// When the provider was last marked unreachable (for cooldown).
    pub(crate) unreachable_since: Option<tokio::time::Instant>,
}

impl HealthRecord {
    pub(crate) fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            latency: None,
            last_checked: None,
            last_error: None,
            unreachable_since: None,
        }
    }

    /// Apply the lazy Unreachable -> Degraded transition once the cooldown
    /// has elapsed.
    pub(crate) fn refresh(&mut self, provider: &str, policy: &HealthPolicy) {
        if self.status != HealthStatus::Unreachable {
            return;
        }
        let (Some(cooldown), Some(since)) = (policy.unreachable_cooldown, self.unreachable_since)
        else {
            return;
        };
        if tokio::time::Instant::now().duration_since(since) >= cooldown {
            self.status = HealthStatus::Degraded;
            self.unreachable_since = None;
            tracing::info!(
                provider = %provider,
                "provider re-admitted as degraded: cooldown expired"
            );
        }
    }

    pub(crate) fn record_success(&mut self, provider: &str, latency: Option<Duration>) {
        let previous = self.status;

        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.unreachable_since = None;
        self.last_checked = Some(Utc::now());

        if let Some(sample) = latency {
            self.latency = Some(match self.latency {
                Some(current) => {
                    let micros = current.as_micros() as f64 * (1.0 - LATENCY_SMOOTHING)
                        + sample.as_micros() as f64 * LATENCY_SMOOTHING;
                    Duration::from_micros(micros.round() as u64)
                }
                None => sample,
            });
        }

        if previous != HealthStatus::Healthy {
            tracing::info!(
                provider = %provider,
                from = %previous,
                "provider HEALTHY: success recorded"
            );
        } else {
            tracing::debug!(provider = %provider, "provider success recorded");
        }
    }

    pub(crate) fn record_failure(&mut self, provider: &str, policy: &HealthPolicy, error: &str) {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.last_checked = Some(Utc::now());
        self.last_error = Some(error.to_string());

        match self.status {
            HealthStatus::Healthy if self.consecutive_failures >= policy.degraded_after => {
                self.status = HealthStatus::Degraded;
                tracing::warn!(
                    provider = %provider,
                    consecutive_failures = self.consecutive_failures,
                    last_error = %error,
                    "provider DEGRADED: {} consecutive failures",
                    self.consecutive_failures,
                );
            }
            HealthStatus::Healthy => {
                tracing::debug!(
                    provider = %provider,
                    consecutive_failures = self.consecutive_failures,
                    "provider failure recorded"
                );
            }
            HealthStatus::Degraded => {
                self.status = HealthStatus::Unreachable;
                self.unreachable_since = Some(tokio::time::Instant::now());
                tracing::warn!(
                    provider = %provider,
                    consecutive_failures = self.consecutive_failures,
                    last_error = %error,
                    "provider UNREACHABLE: failed while degraded"
                );
            }
            HealthStatus::Unreachable => {
                // Fresh failure restarts the cooldown.
                self.unreachable_since = Some(tokio::time::Instant::now());
            }
        }
    }
}
