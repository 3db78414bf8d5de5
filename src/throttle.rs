use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-violation-type rate limiter.
///
/// A type may be submitted at most once per delay window. The stamp is only
/// advanced when a submission is accepted, so repeated denied checks do not
/// push the window forward.
pub struct ViolationThrottle {
    delay: Duration,
    last_submissions: Mutex<HashMap<String, Instant>>,
}

impl ViolationThrottle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_submissions: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a submission of `violation_type` is allowed now.
    ///
    /// Returns true and stamps the current time iff the elapsed time since
    /// the last accepted submission is at least the delay window. The first
    /// check for a type is always allowed.
    pub fn can_submit(&self, violation_type: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_submissions.lock();

        match last.get(violation_type) {
            Some(stamp) if now.duration_since(*stamp) < self.delay => {
                debug!(
                    violation_type,
                    remaining_ms = (self.delay - now.duration_since(*stamp)).as_millis() as u64,
                    "submission throttled"
                );
                false
            }
            _ => {
                last.insert(violation_type.to_string(), now);
                true
            }
        }
    }

    /// Time until `violation_type` may be submitted again.
    pub fn remaining(&self, violation_type: &str) -> Duration {
        let last = self.last_submissions.lock();
        match last.get(violation_type) {
            Some(stamp) => self.delay.saturating_sub(stamp.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Clear the stamp for one type, or all stamps when `None`.
    pub fn reset(&self, violation_type: Option<&str>) {
        let mut last = self.last_submissions.lock();
        match violation_type {
            Some(kind) => {
                last.remove(kind);
            }
            None => last.clear(),
        }
    }
}
