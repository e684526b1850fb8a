//! Timing-faithful replay scheduler.
//!
//! # Responsibilities
//! - Order pending requests by recorded offset
//! - Fire each one when replay time reaches its offset plus warm-up
//! - Resolve the owning session at fire time, in firing order
//! - Reserve the session gate for blocking requests, also in firing order
//! - Spawn each exchange and move on without waiting for its response
//!
//! # Design Decisions
//! - Due time is `timestamp - first timestamp + warmup`, measured from the
//!   dispatcher's creation; the warm-up absorbs the burst of entries that
//!   cluster at offset zero
//! - Skew is logged, never corrected
//! - `clear_queue` is the only cancellation; it drops pending work
//! - Shutdown with queued work left is a scheduling bug and panics

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::{ReplayConfig, SessionConfig};
use crate::observability::metrics;
use crate::replay::connection::ConnectionTracker;
use crate::replay::error::ExchangeError;
use crate::replay::exchange::{self, ExchangeContext};
use crate::replay::listener::ResultListener;
use crate::replay::request::{ReplayItem, ReplayRequest};
use crate::session::{ContextStore, SessionError, SessionResolver, UserAgent};

struct Scheduled {
    due: Duration,
    seq: u64,
    request: ReplayRequest,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    /// Earlier due first; admission order breaks ties.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    warmup: Duration,
    poll_interval: Duration,
    skew_threshold: Duration,
    drain_poll: Duration,
}

pub struct Dispatcher {
    queue: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    /// Recorded timestamp of the first admitted request.
    epoch_ms: Mutex<Option<i64>>,
    seq: AtomicU64,
    started: Instant,
    accepting: AtomicBool,
    input_closed: AtomicBool,
    wake: Notify,
    connections: ConnectionTracker,
    resolver: SessionResolver,
    exchange: Arc<ExchangeContext>,
    timing: Timing,
}

impl Dispatcher {
    pub fn new(
        replay: &ReplayConfig,
        session: &SessionConfig,
        store: Arc<ContextStore>,
        listener: Arc<dyn ResultListener>,
    ) -> Self {
        let exchange = Arc::new(ExchangeContext::new(replay, session, listener, store.stateless()));
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            epoch_ms: Mutex::new(None),
            seq: AtomicU64::new(0),
            started: Instant::now(),
            accepting: AtomicBool::new(true),
            input_closed: AtomicBool::new(false),
            wake: Notify::new(),
            connections: ConnectionTracker::new(),
            resolver: SessionResolver::new(store, session),
            exchange,
            timing: Timing {
                warmup: replay.warmup(),
                poll_interval: replay.poll_interval(),
                skew_threshold: replay.skew_threshold(),
                drain_poll: replay.drain_poll(),
            },
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        self.resolver.store()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().expect("dispatcher queue mutex poisoned").len()
    }

    pub fn active_connections(&self) -> u64 {
        self.connections.active_count()
    }

    /// Replay time elapsed since the dispatcher was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn due_for(&self, timestamp_ms: i64) -> Duration {
        let mut epoch = self.epoch_ms.lock().expect("dispatcher epoch mutex poisoned");
        let epoch = *epoch.get_or_insert(timestamp_ms);
        let offset = u64::try_from(timestamp_ms - epoch).unwrap_or(0);
        Duration::from_millis(offset) + self.timing.warmup
    }

    /// Admit one reader result. Returns false once the queue was cleared.
    pub fn submit(&self, item: ReplayItem) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        let last = item.is_final();
        if let Some(request) = item.into_request() {
            let due = self.due_for(request.timestamp_ms);
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            tracing::trace!(request = %request.label(), due_ms = due.as_millis() as u64, "Scheduled");
            self.queue
                .lock()
                .expect("dispatcher queue mutex poisoned")
                .push(Reverse(Scheduled { due, seq, request }));
        }
        if last {
            self.input_closed.store(true, Ordering::SeqCst);
        }
        self.wake.notify_one();
        true
    }

    /// Drop every pending request and stop admitting new ones.
    pub fn clear_queue(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        let dropped = {
            let mut queue = self.queue.lock().expect("dispatcher queue mutex poisoned");
            let n = queue.len();
            queue.clear();
            n
        };
        self.wake.notify_one();
        tracing::info!(dropped, "Replay queue cleared");
        dropped
    }

    /// Pop the next request if it is due, else how long to wait for it.
    fn next_due(&self) -> Result<Scheduled, Option<Duration>> {
        let mut queue = self.queue.lock().expect("dispatcher queue mutex poisoned");
        let now = self.elapsed();
        match queue.peek().map(|Reverse(next)| next.due) {
            Some(due) if due <= now => queue.pop().map(|Reverse(task)| task).ok_or(None),
            Some(due) => Err(Some(due - now)),
            None => Err(None),
        }
    }

    /// Scheduling loop. Returns when the input is exhausted and every
    /// request has fired, or when the queue is cleared.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(warmup_ms = self.timing.warmup.as_millis() as u64, "Dispatcher started");
        let mut fired = 0u64;
        loop {
            if !self.accepting.load(Ordering::SeqCst) {
                break;
            }
            match self.next_due() {
                Ok(task) => {
                    self.fire(task).await;
                    fired += 1;
                }
                Err(None) if self.input_closed.load(Ordering::SeqCst) => break,
                Err(wait) => {
                    let wait = wait.map_or(self.timing.poll_interval, |w| w.min(self.timing.poll_interval));
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        tracing::info!(fired, "Dispatcher loop finished");
    }

    async fn fire(&self, task: Scheduled) {
        let Scheduled { due, mut request, .. } = task;
        self.check_skew(&request, due);

        if let Err(e) = self.resolver.attach(&mut request).await {
            self.reject(&request, e);
            return;
        }

        // Reserved here, not in the exchange task, so gate order is firing order.
        let ticket = if request.blocking {
            match request
                .session
                .as_deref()
                .ok_or(SessionError::Stateless)
                .and_then(UserAgent::reserve_gate)
            {
                Ok(ticket) => Some(ticket),
                Err(e) => {
                    self.reject(&request, e);
                    return;
                }
            }
        } else {
            None
        };

        let guard = self.connections.track();
        tracing::trace!(exchange = %guard.id(), request = %request.label(), "Firing");
        tokio::spawn(exchange::run(Arc::clone(&self.exchange), request, ticket, guard));
    }

    fn reject(&self, request: &ReplayRequest, error: SessionError) {
        let result = self.exchange.sample(request);
        self.exchange
            .listener()
            .on_failure(&result, &ExchangeError::Session(error));
    }

    /// Log a fire that strays from its due time by more than the threshold.
    /// Returns `"ahead"` or `"behind"` when it does.
    fn check_skew(&self, request: &ReplayRequest, due: Duration) -> Option<&'static str> {
        let actual = self.elapsed();
        let (direction, skew) = if actual >= due {
            ("behind", actual - due)
        } else {
            ("ahead", due - actual)
        };
        if skew <= self.timing.skew_threshold {
            return None;
        }
        metrics::record_skew(direction);
        tracing::warn!(
            request = %request.label(),
            skew_ms = skew.as_millis() as u64,
            direction,
            "Replay timing skew"
        );
        Some(direction)
    }

    /// Stop admitting work and wait for every live exchange to finish.
    ///
    /// # Panics
    /// If requests are still queued; callers must let `run` finish or call
    /// `clear_queue` first.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        self.connections.wait_idle(self.timing.drain_poll).await;
        let pending = self.pending_len();
        assert!(pending == 0, "dispatcher shut down with {pending} queued requests");
        tracing::info!(sessions = self.store().len(), "Dispatcher drained");
    }
}
