//! Attempt history for a single dispatch.

use crate::provider::AdapterError;

/// Record of one failed pre-emission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub provider: String,
    pub error: AdapterError,
}

/// Format attempt records as `"2/alpha, 1/beta"`: failures per provider in
/// first-appearance order.
///
/// Returns `None` when nothing failed.
pub fn format_attempts(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for attempt in attempts {
        if let Some(entry) = counts
            .iter_mut()
            .find(|(name, _)| *name == attempt.provider)
        {
            entry.1 += 1;
        } else {
            counts.push((&attempt.provider, 1));
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}
