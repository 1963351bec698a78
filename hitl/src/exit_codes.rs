//! Stable exit codes for the `hitl` CLI.

/// Command succeeded (answer received, notification queued or acknowledged).
pub const OK: i32 = 0;
/// Command failed due to invalid arguments, config, or an unreachable server.
pub const INVALID: i32 = 1;
/// The request completed without an answer (timeout, cancellation, HITL disabled).
pub const NO_ANSWER: i32 = 2;
