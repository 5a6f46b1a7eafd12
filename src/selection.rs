//! Picking the relay to publish as best for a cycle.

use crate::types::ProbeResult;

/// Select the lowest-latency successful result whose delay is within `ceiling_ms`.
///
/// Ties go to the earliest result in input order. Returns `None` when no
/// result qualifies.
pub fn select(results: &[ProbeResult], ceiling_ms: u64) -> Option<&ProbeResult> {
    results
        .iter()
        .filter(|result| result.is_success())
        .filter(|result| matches!(result.delay_ms, Some(delay) if delay <= ceiling_ms))
        // min_by_key returns the first of several equal minimums.
        .min_by_key(|result| result.delay_ms)
}
