//! In-memory broker correlating producer requests with consumer responses.
//!
//! All mutable state (the in-flight table and the delivery queue) sits behind
//! one mutex whose critical sections never await. Each in-flight entry owns a
//! one-shot result slot; removing the entry under the lock is the single point
//! where a request becomes resolved, so `respond`, the reaper, caller
//! cancellation, and `submit`'s own deadline can race freely and still settle
//! each request at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::core::deadline::{WaitEnd, governing_wait};
use crate::core::types::{Request, RequestId, RequestKind, Response};

/// What `submit` does with a NOTIFY that has no timeout of its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    /// Queue it, keep it acknowledgeable for `notify_retention_secs`, and
    /// return success to the producer right away.
    ///
    /// The entry is reaped once the retention elapses; an untimed NOTIFY
    /// does not stay in flight forever, so unacknowledged notices cannot
    /// accumulate.
    #[default]
    Immediate,
    /// Wait for the acknowledgment like FEEDBACK, for at most
    /// `notify_retention_secs` unless a caller bound is shorter.
    AwaitAck,
}

/// Broker tuning (TOML section `[broker]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Seconds between reaper sweeps.
    pub reaper_interval_secs: u64,

    pub notify_policy: NotifyPolicy,

    /// Seconds a NOTIFY without its own timeout stays in flight.
    pub notify_retention_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reaper_interval_secs: 30,
            notify_policy: NotifyPolicy::Immediate,
            notify_retention_secs: 300,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reaper_interval_secs == 0 {
            return Err(anyhow!("broker.reaper_interval_secs must be > 0"));
        }
        if self.notify_retention_secs == 0 {
            return Err(anyhow!("broker.notify_retention_secs must be > 0"));
        }
        Ok(())
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn notify_retention(&self) -> Duration {
        Duration::from_secs(self.notify_retention_secs)
    }
}

/// Caller errors rejected before `submit` suspends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("request id {0} is already in use")]
    DuplicateId(RequestId),
    #[error("request {0} has no timeout and the caller supplied no wait bound")]
    Unbounded(RequestId),
    #[error("request {0} timeout is out of range")]
    TimeoutOutOfRange(RequestId),
    #[error("broker is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Expiry {
    at: Instant,
    after: Duration,
}

impl Expiry {
    /// Deadline `after` from `now`; a deadline past the clock's range is a
    /// caller error.
    fn after(now: Instant, after: Duration, id: &RequestId) -> Result<Self, SubmitError> {
        let at = now
            .checked_add(after)
            .ok_or_else(|| SubmitError::TimeoutOutOfRange(id.clone()))?;
        Ok(Self { at, after })
    }
}

struct PendingEntry {
    request: Request,
    slot: oneshot::Sender<Response>,
    expiry: Option<Expiry>,
    seq: u64,
}

impl PendingEntry {
    /// Settle the entry. The receiver may already be gone (fire-and-forget
    /// NOTIFY, abandoned caller); the entry is settled either way.
    fn resolve(self, response: Response) {
        let _ = self.slot.send(response);
    }
}

#[derive(Default)]
struct BrokerState {
    in_flight: HashMap<RequestId, PendingEntry>,
    queue: VecDeque<Request>,
    next_seq: u64,
    closed: bool,
}

struct Inner {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    queued: Notify,
}

/// Shared handle to one broker instance. Clones refer to the same state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BrokerState::default()),
                queued: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Submit a request and wait for its outcome, bounded only by the
    /// request's own timeout.
    pub async fn submit(&self, request: Request) -> Result<Response, SubmitError> {
        self.submit_within(request, None).await
    }

    /// Submit a request and wait until it is answered, expires, or `bound`
    /// elapses (whichever is first).
    ///
    /// Timeouts and cancellations come back as failure [`Response`]s. Only
    /// a reused id, a wait that nothing bounds, a timeout past the clock's
    /// range, or a closed broker is an error. Dropping the returned future removes the request from the
    /// in-flight table.
    #[instrument(skip_all, fields(id = %request.id, kind = %request.kind))]
    pub async fn submit_within(
        &self,
        request: Request,
        bound: Option<Duration>,
    ) -> Result<Response, SubmitError> {
        let id = request.id.clone();
        let now = Instant::now();

        let timeout = match request.timeout() {
            None if request.kind == RequestKind::Notify => {
                let retention = self.inner.config.notify_retention();
                if self.inner.config.notify_policy == NotifyPolicy::Immediate {
                    let expiry = Expiry::after(now, retention, &id)?;
                    self.enqueue(request, Some(expiry))?;
                    info!("notification queued");
                    return Ok(Response::ok(id, None));
                }
                Some(retention)
            }
            timeout => timeout,
        };
        let Some((wait, end)) = governing_wait(timeout, bound) else {
            return Err(SubmitError::Unbounded(id));
        };

        let expiry = timeout
            .map(|after| Expiry::after(now, after, &id))
            .transpose()?;
        let mut rx = self.enqueue(request, expiry)?;
        let guard = InFlightGuard {
            broker: self,
            id: &id,
            armed: true,
        };
        info!(wait_secs = wait.as_secs(), "request queued");

        let response = match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::failure(id.clone(), "broker dropped the request"),
            Err(_) => {
                let fallback = match end {
                    WaitEnd::Expired => Response::timed_out(id.clone(), wait),
                    WaitEnd::Abandoned => Response::cancelled(
                        id.clone(),
                        format!("caller stopped waiting after {} seconds", wait.as_secs()),
                    ),
                };
                match self.take(&id) {
                    Some(entry) => {
                        debug!(?end, "deadline elapsed before any response");
                        drop(entry);
                        fallback
                    }
                    // Someone settled the entry between the timer firing and
                    // this lock; their response is already in the slot.
                    None => rx.try_recv().unwrap_or(fallback),
                }
            }
        };
        guard.disarm();

        if response.success {
            info!("request answered");
        } else {
            warn!(error = response.error.as_deref().unwrap_or(""), "request failed");
        }
        Ok(response)
    }

    /// Claim the oldest queued request, waiting up to `wait` for one to
    /// arrive. Returns `None` when the budget elapses or the broker closes.
    ///
    /// Requests that are no longer in flight (expired, cancelled) are
    /// discarded rather than delivered. Dropping the future never loses a
    /// request: items leave the queue only in the same step that returns them.
    pub async fn claim_next(&self, wait: Duration) -> Option<Request> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(request) = self.pop_live() {
                debug!(id = %request.id, "request claimed");
                return Some(request);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Deliver a response. Returns `false` when the id is unknown, expired,
    /// or already resolved; that is the normal "too late" outcome.
    pub fn respond(&self, response: Response) -> bool {
        match self.take(&response.request_id) {
            Some(entry) => {
                debug!(id = %response.request_id, success = response.success, "response delivered");
                entry.resolve(response);
                true
            }
            None => {
                debug!(id = %response.request_id, "response for request not in flight");
                false
            }
        }
    }

    /// Snapshot of every in-flight request (claimed or not), oldest first.
    pub fn list_pending(&self) -> Vec<Request> {
        let state = self.lock();
        let mut entries: Vec<&PendingEntry> = state.in_flight.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| entry.request.clone())
            .collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Requests waiting to be claimed (may include copies that will be skipped).
    pub fn queued_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Expire every entry whose deadline is at or before `now`.
    ///
    /// Queue copies of requests that are no longer in flight are pruned in
    /// the same pass. Returns the number of entries expired.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingEntry> = {
            let mut guard = self.lock();
            let BrokerState {
                in_flight, queue, ..
            } = &mut *guard;
            let ids: Vec<RequestId> = in_flight
                .iter()
                .filter(|(_, entry)| entry.expiry.is_some_and(|expiry| expiry.at <= now))
                .map(|(id, _)| id.clone())
                .collect();
            let expired = ids.iter().filter_map(|id| in_flight.remove(id)).collect();
            queue.retain(|request| in_flight.contains_key(&request.id));
            expired
        };

        let count = expired.len();
        for entry in expired {
            let after = entry.expiry.map(|expiry| expiry.after).unwrap_or_default();
            debug!(id = %entry.request.id, "request expired");
            let response = Response::timed_out(entry.request.id.clone(), after);
            entry.resolve(response);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Stop accepting work: fail every in-flight request with `reason`,
    /// empty the queue, and wake all waiting claimers.
    ///
    /// Later `submit` calls fail with [`SubmitError::Closed`] and `claim_next`
    /// returns `None` at once. Returns the number of requests failed.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.lock();
            state.closed = true;
            state.queue.clear();
            state.in_flight.drain().map(|(_, entry)| entry).collect()
        };
        self.inner.queued.notify_waiters();

        let count = drained.len();
        for entry in drained {
            let response = Response::cancelled(entry.request.id.clone(), reason);
            entry.resolve(response);
        }
        info!(count, reason, "broker closed");
        count
    }

    /// Start the periodic reaper at the configured interval.
    ///
    /// The task holds only a weak reference and exits once every [`Broker`]
    /// handle is dropped, on [`ReaperHandle::shutdown`], or when the
    /// [`ReaperHandle`] itself is dropped.
    pub fn spawn_reaper(&self) -> ReaperHandle {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.reaper_interval();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let reaped = Broker { inner }.reap_expired(Instant::now());
                        if reaped > 0 {
                            info!(reaped, "reaper expired overdue requests");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });

        info!(interval_secs = period.as_secs(), "reaper started");
        ReaperHandle {
            stop: Some(stop_tx),
            task,
        }
    }

    fn enqueue(
        &self,
        request: Request,
        expiry: Option<Expiry>,
    ) -> Result<oneshot::Receiver<Response>, SubmitError> {
        let (slot, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.closed {
                return Err(SubmitError::Closed);
            }
            let id_taken = state.in_flight.contains_key(&request.id)
                || state.queue.iter().any(|queued| queued.id == request.id);
            if id_taken {
                return Err(SubmitError::DuplicateId(request.id));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push_back(request.clone());
            state.in_flight.insert(
                request.id.clone(),
                PendingEntry {
                    request,
                    slot,
                    expiry,
                    seq,
                },
            );
        }
        self.inner.queued.notify_one();
        Ok(rx)
    }

    fn pop_live(&self) -> Option<Request> {
        let mut state = self.lock();
        while let Some(request) = state.queue.pop_front() {
            if state.in_flight.contains_key(&request.id) {
                if !state.queue.is_empty() {
                    self.inner.queued.notify_one();
                }
                return Some(request);
            }
            debug!(id = %request.id, "dropping queued request that is no longer in flight");
        }
        None
    }

    fn take(&self, id: &RequestId) -> Option<PendingEntry> {
        self.lock().in_flight.remove(id)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // No critical section can panic halfway through an update, so the
        // data behind a poisoned lock is still consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the entry if the `submit` future is dropped before it settles.
struct InFlightGuard<'a> {
    broker: &'a Broker,
    id: &'a RequestId,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(entry) = self.broker.take(self.id) {
            debug!(id = %self.id, "submitter went away, cancelling request");
            let response = Response::cancelled(self.id.clone(), "submitter went away");
            entry.resolve(response);
        }
    }
}

/// Control handle for the background reaper.
pub struct ReaperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!(error = %err, "reaper task ended abnormally");
        }
    }
}
