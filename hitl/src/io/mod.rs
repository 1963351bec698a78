//! Side-effecting adapters: configuration, HTTP clients, terminal I/O.

pub mod client;
pub mod config;
pub mod shell_client;
pub mod terminal;
