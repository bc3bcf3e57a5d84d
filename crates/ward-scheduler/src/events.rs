//! Generic timed-event engine: deliver payloads on a channel once their
//! due time has passed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Opaque token identifying one scheduled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    seq: u64,
    at: DateTime<Utc>,
}

impl EventHandle {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.at, self.seq)
    }
}

struct Shared<T> {
    /// Ordered by due time, then insertion sequence.
    pending: Mutex<BTreeMap<(DateTime<Utc>, u64), T>>,
    wake: Notify,
    stop: CancellationToken,
    next_seq: AtomicU64,
}

impl<T> Shared<T> {
    fn pending(&self) -> MutexGuard<'_, BTreeMap<(DateTime<Utc>, u64), T>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending().keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest item if it is due at `now`.
    fn pop_due(&self, now: DateTime<Utc>) -> Option<T> {
        let mut pending = self.pending();
        let key = *pending.keys().next()?;
        if key.0 > now {
            return None;
        }
        pending.remove(&key)
    }
}

/// Time-ordered queue with a background waiter task.
///
/// Items scheduled with [`TimedEvents::schedule_at`] are sent on the delivery
/// channel in due-time order; items due at the same instant keep insertion
/// order. A full channel back-pressures the waiter instead of dropping items.
pub struct TimedEvents<T> {
    shared: Arc<Shared<T>>,
    /// Taken by `start`; `None` afterwards.
    delivery: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T: Send + 'static> TimedEvents<T> {
    pub fn new(delivery: mpsc::Sender<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(BTreeMap::new()),
                wake: Notify::new(),
                stop: CancellationToken::new(),
                next_seq: AtomicU64::new(0),
            }),
            delivery: Mutex::new(Some(delivery)),
        }
    }

    /// Spawn the waiter. The returned handle resolves once the engine stopped.
    ///
    /// Fails with [`SchedulerError::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let tx = self
            .delivery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;
        let shared = Arc::clone(&self.shared);
        Ok(tokio::spawn(run_waiter(shared, tx)))
    }

    /// Schedule `payload` for delivery at or after `at`.
    pub fn schedule_at<Tz: TimeZone>(&self, payload: T, at: DateTime<Tz>) -> EventHandle {
        self.schedule_with(at, |_| payload)
    }

    /// Like [`schedule_at`](Self::schedule_at), but the payload is built with
    /// its own handle.
    pub fn schedule_with<Tz, F>(&self, at: DateTime<Tz>, build: F) -> EventHandle
    where
        Tz: TimeZone,
        F: FnOnce(EventHandle) -> T,
    {
        let handle = EventHandle {
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            at: at.with_timezone(&Utc),
        };
        let payload = build(handle);

        let earliest = {
            let mut pending = self.shared.pending();
            pending.insert(handle.key(), payload);
            pending.keys().next() == Some(&handle.key())
        };
        if earliest {
            self.shared.wake.notify_one();
        }
        handle
    }

    /// Drop a pending item. Returns false if it was already delivered.
    pub fn cancel(&self, handle: EventHandle) -> bool {
        let removed = self.shared.pending().remove(&handle.key()).is_some();
        if removed {
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Number of items not yet delivered.
    pub fn pending(&self) -> usize {
        self.shared.pending().len()
    }

    /// Halt the waiter; pending items are discarded with the engine.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }
}

async fn run_waiter<T>(shared: Arc<Shared<T>>, tx: mpsc::Sender<T>) {
    loop {
        let deadline = shared.next_deadline();
        let sleep = async {
            match deadline {
                Some(at) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            // a new earliest item (or a cancellation) changes the deadline
            _ = shared.wake.notified() => continue,
            _ = sleep => {}
        }

        let Some(payload) = shared.pop_due(Utc::now()) else {
            continue;
        };
        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            sent = tx.send(payload) => {
                if sent.is_err() {
                    debug!("timed-event consumer gone, waiter exiting");
                    break;
                }
            }
        }
    }
}
