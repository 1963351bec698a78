//! CLI tests for the producer commands.
//!
//! Spawns the `hitl` binary and checks exit codes with the broker disabled
//! or unreachable, so no server or operator is needed.

use std::process::Command;

use hitl::exit_codes;

fn hitl() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_hitl"));
    command
        .env_remove("HITL_SERVER_URL")
        .env_remove("HITL_TIMEOUT")
        .env_remove("HITL_GRACE");
    command
}

fn dead_server() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    format!("http://127.0.0.1:{port}")
}

#[test]
fn disabled_feedback_exits_with_no_answer() {
    let output = hitl()
        .env("HITL_ENABLED", "false")
        .args(["feedback", "Ship it?"])
        .output()
        .expect("hitl feedback");

    assert_eq!(output.status.code(), Some(exit_codes::NO_ANSWER));
    assert!(output.stdout.is_empty());
}

#[test]
fn disabled_notify_succeeds() {
    let status = hitl()
        .env("HITL_ENABLED", "false")
        .args(["notify", "Deploy finished", "--source", "ci"])
        .status()
        .expect("hitl notify");

    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn unreachable_server_means_no_answer() {
    let status = hitl()
        .env("HITL_ENABLED", "true")
        .args(["--server", &dead_server(), "feedback", "anyone?", "--timeout", "1"])
        .status()
        .expect("hitl feedback");

    assert_eq!(status.code(), Some(exit_codes::NO_ANSWER));
}

#[test]
fn invalid_context_is_rejected() {
    let status = hitl()
        .env("HITL_ENABLED", "false")
        .args(["feedback", "ok?", "--context", "[1, 2]"])
        .status()
        .expect("hitl feedback");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn health_against_dead_server_is_invalid() {
    let status = hitl()
        .args(["health", "--server", &dead_server()])
        .status()
        .expect("hitl health");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
