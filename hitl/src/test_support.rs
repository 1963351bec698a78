//! Test-only helpers for building requests and scripting the operator side.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::broker::Broker;
use crate::consumer::{Answer, Responder};
use crate::core::types::{Request, RequestId};

/// FEEDBACK request with a fixed broker timeout.
pub fn feedback_request(prompt: &str, timeout_secs: u64) -> Request {
    Request::feedback(prompt)
        .with_source("test-tool")
        .with_timeout(Duration::from_secs(timeout_secs))
}

/// NOTIFY request without a timeout.
pub fn notify_request(message: &str) -> Request {
    Request::notify(message).with_source("test-tool")
}

/// Yield until `count` requests are in flight. Panics if that never happens.
pub async fn wait_for_in_flight(broker: &Broker, count: usize) {
    for _ in 0..1_000 {
        if broker.in_flight_count() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!(
        "expected {} in-flight requests, found {}",
        count,
        broker.in_flight_count()
    );
}

/// Responder that replays queued answers in order.
///
/// Once the script runs out, `answer` never completes, which models an
/// operator who walked away.
#[derive(Debug, Default)]
pub struct ScriptedResponder {
    answers: VecDeque<Result<Answer, String>>,
    delay: Duration,
    /// Ids of every request the responder was asked about.
    pub seen: Vec<RequestId>,
}

impl ScriptedResponder {
    pub fn new(answers: Vec<Result<Answer, String>>) -> Self {
        Self {
            answers: answers.into(),
            delay: Duration::ZERO,
            seen: Vec::new(),
        }
    }

    /// Wait `delay` before each answer (a slow human).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Responder for ScriptedResponder {
    async fn answer(&mut self, request: &Request) -> Result<Answer> {
        self.seen.push(request.id.clone());
        let Some(next) = self.answers.pop_front() else {
            return std::future::pending().await;
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        next.map_err(|err| anyhow!(err))
    }
}
