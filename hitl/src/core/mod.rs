//! Deterministic, pure logic shared by the broker and its adapters.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return deterministic outputs suitable for tests.

pub mod deadline;
pub mod sanitize;
pub mod types;
