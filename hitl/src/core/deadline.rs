//! Deadline arithmetic for suspended broker calls.

use std::time::Duration;

/// How a bounded wait ends when nothing resolves it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEnd {
    /// The request's own timeout elapsed.
    Expired,
    /// The caller's bound elapsed before the request's timeout.
    Abandoned,
}

/// Pick the wait that governs a submission.
///
/// The request's own timeout wins ties; the caller bound only matters when it
/// is strictly shorter or when the request never expires on its own.
/// Returns `None` when neither side bounds the wait.
pub fn governing_wait(
    request_timeout: Option<Duration>,
    caller_bound: Option<Duration>,
) -> Option<(Duration, WaitEnd)> {
    match (request_timeout, caller_bound) {
        (Some(timeout), Some(bound)) if bound < timeout => Some((bound, WaitEnd::Abandoned)),
        (Some(timeout), _) => Some((timeout, WaitEnd::Expired)),
        (None, Some(bound)) => Some((bound, WaitEnd::Abandoned)),
        (None, None) => None,
    }
}

/// Resolve a long-poll budget requested by a consumer.
///
/// Missing, negative, or non-finite values fall back to `default`; everything
/// is capped at `max`.
pub fn poll_budget(requested_secs: Option<f64>, default: Duration, max: Duration) -> Duration {
    match requested_secs.filter(|secs| secs.is_finite() && *secs >= 0.0) {
        // Clamp in f64 first: from_secs_f64 panics on overflow.
        Some(secs) => Duration::from_secs_f64(secs.min(max.as_secs_f64())),
        None => default.min(max),
    }
}
