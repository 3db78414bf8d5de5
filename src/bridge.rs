use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// Bounded hand-off from the blocking capture loop to the async delivery
/// layer.
///
/// A single slot holds the newest encoded frame. Publishing overwrites an
/// undrained frame (delivery is best-effort-freshest) and waits at most the
/// configured enqueue timeout for the slot, so the producer is never
/// backpressured by slow consumers. Consumers await the sequence counter and
/// always observe the most recently published frame.
pub struct FrameBridge {
    slot: Mutex<Option<Bytes>>,
    seq: AtomicU64,
    notify: Notify,
    enqueue_timeout: Duration,
    stats: BridgeStats,
}

/// Publish counters for monitoring.
#[derive(Debug, Default)]
pub struct BridgeStats {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of the bridge counters.
#[derive(Debug, Clone, Copy)]
pub struct BridgeStatsSnapshot {
    pub published: u64,
    pub dropped: u64,
}

impl FrameBridge {
    pub fn new(enqueue_timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            enqueue_timeout,
            stats: BridgeStats::default(),
        }
    }

    /// Hand a frame to the delivery layer. Called from the capture thread.
    ///
    /// Returns false when the slot could not be acquired within the enqueue
    /// timeout; the frame is silently dropped, not retried.
    pub fn publish(&self, payload: Bytes) -> bool {
        match self.slot.try_lock_for(self.enqueue_timeout) {
            Some(mut slot) => {
                *slot = Some(payload);
                drop(slot);
                self.seq.fetch_add(1, Ordering::Release);
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_waiters();
                true
            }
            None => {
                trace!("delivery slot busy, dropping frame");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Await a frame newer than `last_seq`; returns the new sequence number
    /// and the frame bytes.
    ///
    /// Frames published while the caller was busy are skipped, never
    /// queued: the caller always gets the newest one.
    pub async fn next_after(&self, last_seq: u64) -> (u64, Bytes) {
        loop {
            // Register interest before checking the sequence so a publish
            // racing with the check cannot be missed.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let current = self.seq.load(Ordering::Acquire);
            if current > last_seq {
                if let Some(bytes) = self.slot.lock().clone() {
                    return (current, bytes);
                }
            }

            notified.await;
        }
    }

    /// Sequence number of the most recently published frame.
    pub fn latest_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            published: self.stats.published.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
