use crate::backend::{BackendClient, ViolationDetail};
use crate::detect::violation_code_for;
use crate::frame::{self, Detection, Frame};
use crate::throttle::ViolationThrottle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Poll interval of the submission context.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A pending violation report: a non-compliant detection together with the
/// frame that witnessed it.
///
/// At most one event per violation type is ever pending; a newer detection
/// of the same type replaces the buffered one. The event is destroyed after
/// a submission attempt (success or failure) or when overwritten.
#[derive(Debug, Clone)]
pub struct ViolationEvent {
    /// Violation type, the detected class name (e.g. "no-mask")
    pub kind: String,
    /// Mapped backend violation code (e.g. "NO_MASK")
    pub code: String,
    /// Snapshot of the annotated frame that witnessed the violation
    pub frame: Frame,
    /// Free-text note attached to the report
    pub note: String,
    /// When the event was created
    pub created_at: SystemTime,
}

impl ViolationEvent {
    pub fn from_detection(frame: &Frame, detection: &Detection) -> Self {
        let kind = detection.class_name.clone();
        Self {
            code: violation_code_for(&kind),
            note: format!("Detected {}", kind),
            kind,
            frame: frame.clone(),
            created_at: SystemTime::now(),
        }
    }
}

/// Shared buffer of pending violations, keyed by violation type.
///
/// Written by the capture loop, drained by the submission context.
#[derive(Default)]
pub struct PendingViolations {
    inner: Mutex<HashMap<String, ViolationEvent>>,
}

impl PendingViolations {
    /// Upsert an event, replacing any not-yet-submitted event of the same
    /// type (latest wins).
    pub fn record(&self, event: ViolationEvent) {
        self.inner.lock().insert(event.kind.clone(), event);
    }

    /// Atomically swap out the entire pending buffer.
    pub fn drain(&self) -> HashMap<String, ViolationEvent> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Asynchronous violation submitter.
///
/// Runs on its own OS thread driving an isolated single-threaded runtime so
/// submission latency never shares a call stack with the capture loop.
/// Delivery is at-most-once per throttle window: a failed submission is
/// logged and the event discarded, never requeued.
pub struct ViolationSubmitter {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ViolationSubmitter {
    /// Spawn the submission context.
    pub fn start(
        pending: Arc<PendingViolations>,
        throttle: Arc<ViolationThrottle>,
        client: BackendClient,
        jpeg_quality: u8,
    ) -> crate::error::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("violation-submitter".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("failed to build submitter runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(async {
                    let mut tick = tokio::time::interval(POLL_INTERVAL);
                    while !thread_shutdown.load(Ordering::Relaxed) {
                        tick.tick().await;
                        process_pending(&pending, &throttle, &client, jpeg_quality).await;
                    }
                });
            })?;

        info!("violation submitter started");
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stop the submission context and wait for it to wind down.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("violation submitter thread panicked");
            } else {
                info!("violation submitter stopped");
            }
        }
    }
}

impl Drop for ViolationSubmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain the pending buffer and submit whatever the throttle permits.
async fn process_pending(
    pending: &PendingViolations,
    throttle: &ViolationThrottle,
    client: &BackendClient,
    jpeg_quality: u8,
) {
    for (kind, event) in pending.drain() {
        if !throttle.can_submit(&kind) {
            debug!(kind, "violation dropped: throttle window closed");
            continue;
        }
        submit_event(client, event, jpeg_quality).await;
    }
}

/// Submit a single buffered event, persisting its snapshot to a uniquely
/// named temporary file for the duration of the upload.
async fn submit_event(client: &BackendClient, event: ViolationEvent, jpeg_quality: u8) {
    let jpeg = match frame::encode_jpeg(&event.frame, jpeg_quality) {
        Ok(jpeg) => jpeg,
        Err(e) => {
            warn!(kind = %event.kind, "could not encode violation snapshot: {}", e);
            return;
        }
    };

    let path = temp_snapshot_path(&event.kind);
    if let Err(e) = std::fs::write(&path, &jpeg) {
        warn!(kind = %event.kind, "could not write violation snapshot: {}", e);
        return;
    }

    let details = [ViolationDetail::new(event.code.clone())];
    match client
        .submit_violation(&path, &details, Some(&event.note))
        .await
    {
        Ok(_) => info!(kind = %event.kind, code = %event.code, "violation reported"),
        // Best-effort delivery: the next eligible detection retries
        // naturally once the throttle window reopens.
        Err(e) => warn!(kind = %event.kind, "failed to submit violation: {}", e),
    }

    if let Err(e) = std::fs::remove_file(&path) {
        debug!("could not remove snapshot {}: {}", path.display(), e);
    }
}

fn temp_snapshot_path(kind: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "violation_{}_{}_{}.jpg",
        chrono::Utc::now().timestamp(),
        Uuid::new_v4().simple(),
        kind
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked_frame(marker: u8) -> Frame {
        Frame::new(vec![marker; Frame::frame_size(4, 2)], 4, 2)
    }

    fn event(kind: &str, marker: u8) -> ViolationEvent {
        let detection = Detection {
            class_id: 5,
            class_name: kind.to_string(),
            confidence: 0.9,
            bbox: [0.0, 0.0, 1.0, 1.0],
        };
        ViolationEvent::from_detection(&marked_frame(marker), &detection)
    }

    #[test]
    fn test_event_carries_mapped_code_and_note() {
        let event = event("no-mask", 1);
        assert_eq!(event.kind, "no-mask");
        assert_eq!(event.code, "NO_MASK");
        assert_eq!(event.note, "Detected no-mask");
    }

    #[test]
    fn test_latest_wins_per_type() {
        let pending = PendingViolations::default();
        pending.record(event("no-mask", 1));
        pending.record(event("no-mask", 2));
        pending.record(event("no-mask", 3));

        let drained = pending.drain();
        assert_eq!(drained.len(), 1);
        // Only the most recently buffered frame survives
        assert_eq!(drained["no-mask"].frame.data[0], 3);
    }

    #[test]
    fn test_types_buffer_independently() {
        let pending = PendingViolations::default();
        pending.record(event("no-mask", 1));
        pending.record(event("no-apron", 2));
        pending.record(event("no-mask", 3));

        let drained = pending.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained["no-mask"].frame.data[0], 3);
        assert_eq!(drained["no-apron"].frame.data[0], 2);
    }

    #[test]
    fn test_drain_empties_buffer() {
        let pending = PendingViolations::default();
        pending.record(event("no-mask", 1));
        assert_eq!(pending.len(), 1);

        let drained = pending.drain();
        assert_eq!(drained.len(), 1);
        assert!(pending.is_empty());
        assert!(pending.drain().is_empty());
    }

    #[test]
    fn test_one_submission_per_throttle_cycle() {
        // Three detections of the same type in one cycle with the window
        // open once: exactly one event survives the drain, and the
        // throttle accepts it exactly once.
        let pending = PendingViolations::default();
        let throttle = ViolationThrottle::new(Duration::from_secs(5));

        for marker in 1..=3 {
            pending.record(event("no-mask", marker));
        }

        let mut submitted = Vec::new();
        for (kind, event) in pending.drain() {
            if throttle.can_submit(&kind) {
                submitted.push(event);
            }
        }

        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].frame.data[0], 3);

        // A second cycle inside the window submits nothing.
        pending.record(event("no-mask", 4));
        let resubmitted: Vec<_> = pending
            .drain()
            .into_iter()
            .filter(|(kind, _)| throttle.can_submit(kind))
            .collect();
        assert!(resubmitted.is_empty());
    }

    #[test]
    fn test_temp_snapshot_paths_are_unique() {
        let a = temp_snapshot_path("no-mask");
        let b = temp_snapshot_path("no-mask");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with("no-mask.jpg"));
    }
}
