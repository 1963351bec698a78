//! Operator-side loop: claim a request, obtain an answer, report it back.
//!
//! The loop is transport-agnostic. [`QueueSource`] is implemented by the
//! in-process [`Broker`] and by the HTTP [`crate::io::shell_client::ShellClient`];
//! [`Responder`] is implemented by the terminal and by scripted test doubles.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::broker::Broker;
use crate::core::types::{Request, RequestId, Response};

/// Outcome of delivering a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The response resolved the pending request.
    Delivered,
    /// The request already expired, was answered, or never existed.
    NotFound,
}

/// Where a consumer claims requests and sends responses.
///
/// `Err` means the transport itself failed; "nothing queued" and "too late"
/// are ordinary values.
pub trait QueueSource {
    fn claim_next(&self, wait: Duration) -> impl Future<Output = Result<Option<Request>>> + Send;

    fn respond(&self, response: Response) -> impl Future<Output = Result<Delivery>> + Send;
}

impl QueueSource for Broker {
    async fn claim_next(&self, wait: Duration) -> Result<Option<Request>> {
        Ok(Broker::claim_next(self, wait).await)
    }

    async fn respond(&self, response: Response) -> Result<Delivery> {
        Ok(if Broker::respond(self, response) {
            Delivery::Delivered
        } else {
            Delivery::NotFound
        })
    }
}

/// What the operator said.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Normal completion carrying a value (feedback text, `true` for an ack).
    Value(Value),
    /// The operator refused; the text becomes the failure error.
    Declined(String),
}

/// Obtains an answer for one claimed request.
pub trait Responder {
    fn answer(&mut self, request: &Request) -> impl Future<Output = Result<Answer>> + Send;
}

/// Timing knobs for [`run_consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Long-poll budget per claim.
    pub poll_wait: Duration,
    /// Pause after a failed claim before polling again.
    pub retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Progress notifications emitted by [`run_consumer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// A poll ended with nothing to claim.
    Idle,
    /// A request was claimed and handed to the responder.
    Claimed(Request),
    /// The responder produced an answer.
    Answered(RequestId),
    Delivered(RequestId),
    /// The broker no longer knew the request (expired or already answered).
    NotFound(RequestId),
    /// The transport failed while delivering; the request is not retried.
    DeliveryFailed { id: RequestId, error: String },
    ClaimFailed(String),
    /// Shutdown interrupted the responder; a cancellation was sent instead.
    Cancelled(RequestId),
}

/// Counters returned when [`run_consumer`] exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub claimed: u32,
    pub delivered: u32,
    pub not_found: u32,
    pub delivery_failed: u32,
}

/// Run the consumer loop until `shutdown` completes.
///
/// Transport failures are logged and never end the loop. If shutdown fires
/// while a request is claimed, a best-effort "User cancelled" failure is
/// delivered for it before returning.
#[instrument(skip_all, fields(poll_secs = config.poll_wait.as_secs()))]
pub async fn run_consumer<S, R, D, F>(
    source: &S,
    responder: &mut R,
    config: &ConsumerConfig,
    shutdown: D,
    mut on_event: F,
) -> ConsumerStats
where
    S: QueueSource,
    R: Responder,
    D: Future<Output = ()>,
    F: FnMut(&ConsumerEvent),
{
    tokio::pin!(shutdown);
    let mut stats = ConsumerStats::default();
    info!("consumer started");

    loop {
        let claimed = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            claimed = source.claim_next(config.poll_wait) => claimed,
        };

        let request = match claimed {
            Ok(Some(request)) => request,
            Ok(None) => {
                on_event(&ConsumerEvent::Idle);
                continue;
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(error = %error, "claim failed");
                on_event(&ConsumerEvent::ClaimFailed(error));
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(config.retry_delay) => continue,
                }
            }
        };

        let id = request.id.clone();
        stats.claimed += 1;
        debug!(id = %id, kind = %request.kind, "claimed request");
        on_event(&ConsumerEvent::Claimed(request.clone()));

        let answer = tokio::select! {
            biased;
            _ = &mut shutdown => {
                on_event(&ConsumerEvent::Cancelled(id.clone()));
                let response = Response::failure(id, "User cancelled");
                deliver(source, response, &mut stats, &mut on_event).await;
                break;
            }
            answer = responder.answer(&request) => answer,
        };

        let response = match answer {
            Ok(Answer::Value(value)) => Response::ok(id.clone(), Some(value)),
            Ok(Answer::Declined(reason)) => Response::failure(id.clone(), reason),
            Err(err) => {
                warn!(id = %id, error = %format!("{err:#}"), "responder failed");
                Response::failure(id.clone(), format!("{err:#}"))
            }
        };
        on_event(&ConsumerEvent::Answered(id));
        deliver(source, response, &mut stats, &mut on_event).await;
    }

    info!(
        claimed = stats.claimed,
        delivered = stats.delivered,
        "consumer stopped"
    );
    stats
}

async fn deliver<S, F>(source: &S, response: Response, stats: &mut ConsumerStats, on_event: &mut F)
where
    S: QueueSource,
    F: FnMut(&ConsumerEvent),
{
    let id = response.request_id.clone();
    match source.respond(response).await {
        Ok(Delivery::Delivered) => {
            stats.delivered += 1;
            on_event(&ConsumerEvent::Delivered(id));
        }
        Ok(Delivery::NotFound) => {
            stats.not_found += 1;
            info!(id = %id, "request expired or was already answered");
            on_event(&ConsumerEvent::NotFound(id));
        }
        Err(err) => {
            stats.delivery_failed += 1;
            let error = format!("{err:#}");
            warn!(id = %id, error = %error, "failed to deliver response");
            on_event(&ConsumerEvent::DeliveryFailed { id, error });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use serde_json::json;

    use super::*;
    use crate::test_support::{ScriptedResponder, feedback_request, notify_request};

    fn quick_config() -> ConsumerConfig {
        ConsumerConfig {
            poll_wait: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Broker wrapper whose transport fails on demand.
    struct FlakySource {
        broker: Broker,
        claim_failures: AtomicUsize,
        fail_responds: bool,
    }

    impl QueueSource for FlakySource {
        async fn claim_next(&self, wait: Duration) -> Result<Option<Request>> {
            if self
                .claim_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("connection refused");
            }
            Ok(self.broker.claim_next(wait).await)
        }

        async fn respond(&self, response: Response) -> Result<Delivery> {
            if self.fail_responds {
                bail!("connection reset");
            }
            QueueSource::respond(&self.broker, response).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn answers_feedback_and_unblocks_producer() {
        let broker = Broker::default();
        let producer = broker.clone();
        let submit = tokio::spawn(async move { producer.submit(feedback_request("ok?", 60)).await });

        let mut responder = ScriptedResponder::new(vec![Ok(Answer::Value(json!("lgtm")))]);
        let stats = run_consumer(
            &broker,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(10)),
            |_| {},
        )
        .await;

        let response = submit.await.expect("join").expect("submit");
        assert!(response.success);
        assert_eq!(response.value, Some(json!("lgtm")));
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledges_notifications() {
        let broker = Broker::default();
        broker.submit(notify_request("done")).await.expect("submit");

        let mut responder = ScriptedResponder::new(vec![Ok(Answer::Value(json!(true)))]);
        let mut events = Vec::new();
        let stats = run_consumer(
            &broker,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(3)),
            |event| events.push(event.clone()),
        )
        .await;

        assert_eq!(stats.delivered, 1);
        assert_eq!(broker.in_flight_count(), 0);
        assert!(matches!(events[0], ConsumerEvent::Claimed(_)));
        assert!(matches!(events[1], ConsumerEvent::Answered(_)));
        assert!(matches!(events[2], ConsumerEvent::Delivered(_)));
        assert!(events[3..].iter().all(|event| *event == ConsumerEvent::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn responder_error_becomes_failure_response() {
        let broker = Broker::default();
        let producer = broker.clone();
        let submit = tokio::spawn(async move { producer.submit(feedback_request("ok?", 60)).await });

        let mut responder = ScriptedResponder::new(vec![Err("stdin closed".to_string())]);
        run_consumer(
            &broker,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(3)),
            |_| {},
        )
        .await;

        let response = submit.await.expect("join").expect("submit");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("stdin closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn declined_answer_is_a_failure() {
        let broker = Broker::default();
        let producer = broker.clone();
        let submit = tokio::spawn(async move { producer.submit(feedback_request("ok?", 60)).await });

        let mut responder =
            ScriptedResponder::new(vec![Ok(Answer::Declined("not my call".to_string()))]);
        run_consumer(
            &broker,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(3)),
            |_| {},
        )
        .await;

        let response = submit.await.expect("join").expect("submit");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("not my call"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_claimed_sends_cancellation() {
        let broker = Broker::default();
        let producer = broker.clone();
        let submit = tokio::spawn(async move { producer.submit(feedback_request("ok?", 60)).await });

        // No scripted answers: the operator never replies.
        let mut responder = ScriptedResponder::new(Vec::new());
        let mut events = Vec::new();
        let stats = run_consumer(
            &broker,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(5)),
            |event| events.push(event.clone()),
        )
        .await;

        let response = submit.await.expect("join").expect("submit");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("User cancelled"));
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.delivered, 1);
        assert!(events.iter().any(|e| matches!(e, ConsumerEvent::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn late_answer_is_not_found_and_loop_continues() {
        let broker = Broker::default();
        let producer = broker.clone();
        let submit = tokio::spawn(async move { producer.submit(feedback_request("quick?", 1)).await });

        let mut responder = ScriptedResponder::new(vec![Ok(Answer::Value(json!("too slow")))])
            .with_delay(Duration::from_secs(2));
        let stats = run_consumer(
            &broker,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(10)),
            |_| {},
        )
        .await;

        let response = submit.await.expect("join").expect("submit");
        assert!(!response.success);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_failures_are_retried() {
        let source = FlakySource {
            broker: Broker::default(),
            claim_failures: AtomicUsize::new(2),
            fail_responds: false,
        };
        source.broker.submit(notify_request("hi")).await.expect("submit");

        let mut responder = ScriptedResponder::new(vec![Ok(Answer::Value(json!(true)))]);
        let mut failures = 0;
        let stats = run_consumer(
            &source,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(20)),
            |event| {
                if matches!(event, ConsumerEvent::ClaimFailed(_)) {
                    failures += 1;
                }
            },
        )
        .await;

        assert_eq!(failures, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_is_terminal_for_the_request() {
        let source = FlakySource {
            broker: Broker::default(),
            claim_failures: AtomicUsize::new(0),
            fail_responds: true,
        };
        source.broker.submit(notify_request("a")).await.expect("submit");
        source.broker.submit(notify_request("b")).await.expect("submit");

        let mut responder = ScriptedResponder::new(vec![
            Ok(Answer::Value(json!(true))),
            Ok(Answer::Value(json!(true))),
        ]);
        let stats = run_consumer(
            &source,
            &mut responder,
            &quick_config(),
            tokio::time::sleep(Duration::from_secs(5)),
            |_| {},
        )
        .await;

        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.delivery_failed, 2);
        assert_eq!(responder.seen.len(), 2);
        // Undelivered acknowledgments leave the entries for the reaper.
        assert_eq!(source.broker.in_flight_count(), 2);
    }
}
