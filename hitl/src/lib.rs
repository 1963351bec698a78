//! Human-in-the-loop request broker.
//!
//! Automated tools (producers) pause on a [`core::types::Request`] and resume
//! once an operator-facing consumer supplies the matching
//! [`core::types::Response`]. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure data and deterministic helpers (model, sanitization,
//!   deadline math). No I/O.
//! - **[`broker`]**: The only stateful piece. Correlates requests with
//!   responses, owns the delivery queue, and expires overdue entries.
//! - **[`io`]**: Side-effecting adapters (environment/TOML config, HTTP
//!   clients, terminal rendering). Isolated so tests can swap them out.
//!
//! [`consumer`] drives the operator side on top of any
//! [`consumer::QueueSource`], local or remote.

pub mod broker;
pub mod consumer;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
