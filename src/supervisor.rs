use crate::bridge::FrameBridge;
use crate::config::{OutputMode, PpecamConfig};
use crate::detect::Detector;
use crate::frame::{Detection, Frame};
use crate::hls::{self, RetentionManager, SegmentEncoder};
use crate::push::MultipartEncoder;
use crate::source::SourceFactory;
use crate::status::SystemStatus;
use crate::violations::{PendingViolations, ViolationEvent};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Fixed delay before a failed or ended session is retried.
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(3);
/// Wall-clock interval between heartbeat log lines.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Frame cadence for progress logs and playlist housekeeping.
const PROGRESS_INTERVAL: u64 = 100;

/// Lifecycle of one pipeline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Connected,
    Streaming,
    /// The source reported end-of-stream; reconnect cleanly
    Ended,
    /// Source, encoder, or delivery raised an error
    Failed,
    Restarting,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Starting => "starting",
            PipelineState::Connected => "connected",
            PipelineState::Streaming => "streaming",
            PipelineState::Ended => "ended",
            PipelineState::Failed => "failed",
            PipelineState::Restarting => "restarting",
        };
        write!(f, "{}", name)
    }
}

/// Owns the capture -> detect -> deliver cycle.
///
/// Runs on a dedicated OS thread, blocking on source reads and detection.
/// Source failures never propagate out: each session ends in `Ended` or
/// `Failed`, and after a fixed backoff a fresh session begins with a new
/// source adapter (and, in segmented mode, a new encoder). Only throttle
/// state and cumulative status survive a restart. Cancellation is the only
/// way out of the loop.
pub struct PipelineSupervisor {
    config: PpecamConfig,
    width: u32,
    height: u32,
    fps: f64,
    source_factory: SourceFactory,
    detector: Box<dyn Detector>,
    bridge: Arc<FrameBridge>,
    status: Arc<SystemStatus>,
    pending: Arc<PendingViolations>,
    cancel: CancellationToken,
    restart_backoff: Duration,
    heartbeat_interval: Duration,
}

impl PipelineSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PpecamConfig,
        (width, height): (u32, u32),
        fps: f64,
        source_factory: SourceFactory,
        detector: Box<dyn Detector>,
        bridge: Arc<FrameBridge>,
        status: Arc<SystemStatus>,
        pending: Arc<PendingViolations>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            width,
            height,
            fps,
            source_factory,
            detector,
            bridge,
            status,
            pending,
            cancel,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Override restart/heartbeat timing.
    pub fn with_timing(mut self, restart_backoff: Duration, heartbeat_interval: Duration) -> Self {
        self.restart_backoff = restart_backoff;
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Spawn the supervisory loop on its own thread.
    pub fn spawn(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("capture-pipeline".to_string())
            .spawn(move || self.run())
    }

    /// Run sessions until cancelled.
    pub fn run(mut self) {
        info!(
            "capture pipeline starting ({}x{} @ {:.2} fps, {} mode)",
            self.width, self.height, self.fps, self.config.output.mode
        );

        while !self.cancel.is_cancelled() {
            let outcome = self.run_session();
            if self.cancel.is_cancelled() {
                break;
            }

            info!(
                session = %outcome,
                "restarting in {:?}", self.restart_backoff
            );
            self.transition(outcome, PipelineState::Restarting);
            self.backoff_wait();
        }

        self.status.set_capture_alive(false);
        info!("capture pipeline stopped");
    }

    /// Run one source session to completion. Returns `Ended` for a clean
    /// end-of-stream, `Failed` for any error.
    fn run_session(&mut self) -> PipelineState {
        let mut state = PipelineState::Starting;
        info!(state = %state, "opening source");

        let mut source = match (self.source_factory)() {
            Ok(source) => source,
            Err(e) => {
                error!("failed to construct source: {}", e);
                self.status.set_source_connected(false);
                return PipelineState::Failed;
            }
        };

        if let Err(e) = source.start() {
            error!("failed to start source: {}", e);
            self.status.set_source_connected(false);
            return PipelineState::Failed;
        }

        self.transition(state, PipelineState::Connected);
        state = PipelineState::Connected;
        self.status.set_source_connected(true);
        self.status.set_capture_alive(true);

        let push_encoder = MultipartEncoder::new(
            &self.config.output.boundary,
            self.config.output.jpeg_quality,
        );
        let retention = RetentionManager::new(
            self.config.output.output_dir.clone(),
            self.config.output.retention_keep_count(),
        );

        let mut segment_encoder = match self.config.output.mode {
            OutputMode::Segmented => {
                let mut encoder = SegmentEncoder::new(
                    &self.config.output,
                    &self.config.ffmpeg.loglevel,
                    self.width,
                    self.height,
                    self.fps,
                );
                if let Err(e) = encoder.start() {
                    error!("failed to start segment encoder: {}", e);
                    source.stop();
                    self.status.set_source_connected(false);
                    return PipelineState::Failed;
                }
                Some(encoder)
            }
            OutputMode::Push => None,
        };

        let mut frame_count: u64 = 0;
        let session_started = Instant::now();
        let mut last_heartbeat = Instant::now();

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break PipelineState::Ended;
            }

            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("source reported end of stream");
                    break PipelineState::Ended;
                }
                Err(e) => {
                    error!("source read failed: {}", e);
                    break PipelineState::Failed;
                }
            };

            if state == PipelineState::Connected {
                self.transition(state, PipelineState::Streaming);
                state = PipelineState::Streaming;
            }

            let (annotated, detections) = match self.detector.detect(&frame) {
                Ok(result) => result,
                Err(e) => {
                    error!("detection failed: {}", e);
                    break PipelineState::Failed;
                }
            };

            match &mut segment_encoder {
                Some(encoder) => {
                    if let Err(e) = encoder.write_frame(&annotated) {
                        error!("segment encoder rejected frame: {}", e);
                        break PipelineState::Failed;
                    }
                }
                None => {
                    // Encode failures skip this frame only
                    if let Some(record) = push_encoder.encode_frame(&annotated) {
                        self.bridge.publish(record);
                    }
                }
            }

            self.collect_violations(&annotated, &detections);

            frame_count += 1;
            if frame_count % PROGRESS_INTERVAL == 0 {
                info!(frames = frame_count, "session progress");
                if segment_encoder.is_some() {
                    let playlist = self.config.output.playlist_path();
                    if !hls::is_playlist_valid(&playlist) {
                        warn!(playlist = %playlist.display(), "playlist is invalid");
                    }
                    retention.cleanup_old_segments();
                }
            }

            if last_heartbeat.elapsed() >= self.heartbeat_interval {
                info!(
                    uptime_s = session_started.elapsed().as_secs(),
                    frames = frame_count,
                    source_connected = self.status.source_connected(),
                    detector_ready = self.status.detector_ready(),
                    clients = self.status.active_clients(),
                    "heartbeat"
                );
                last_heartbeat = Instant::now();
            }
        };

        source.stop();
        if let Some(mut encoder) = segment_encoder.take() {
            encoder.stop();
        }
        self.status.set_source_connected(false);

        self.transition(state, outcome);
        outcome
    }

    /// Buffer a pending violation for every non-compliant detection.
    ///
    /// Each violation type present in the frame gets its own latest-wins
    /// slot; types are reported independently, never batched.
    fn collect_violations(&self, frame: &Frame, detections: &[Detection]) {
        for detection in detections.iter().filter(|d| d.is_violation()) {
            self.pending
                .record(ViolationEvent::from_detection(frame, detection));
        }
    }

    fn transition(&self, from: PipelineState, to: PipelineState) {
        if from != to {
            info!(from = %from, to = %to, "pipeline state changed");
        }
    }

    /// Sleep out the restart backoff without ignoring cancellation.
    fn backoff_wait(&self) {
        let deadline = Instant::now() + self.restart_backoff;
        while Instant::now() < deadline && !self.cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(50).min(self.restart_backoff));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PpecamError, Result};
    use crate::source::FrameSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        frames: Vec<Frame>,
        fail_start: bool,
    }

    impl FrameSource for StubSource {
        fn start(&mut self) -> Result<()> {
            if self.fail_start {
                Err(PpecamError::source("device 9 does not exist"))
            } else {
                Ok(())
            }
        }

        fn read_frame(&mut self) -> Result<Option<Frame>> {
            if self.frames.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.frames.remove(0)))
            }
        }

        fn stop(&mut self) {}
    }

    struct StubDetector {
        detections: Vec<Detection>,
    }

    impl Detector for StubDetector {
        fn detect(&mut self, frame: &Frame) -> Result<(Frame, Vec<Detection>)> {
            Ok((frame.clone(), self.detections.clone()))
        }
    }

    fn test_frame(marker: u8) -> Frame {
        Frame::new(vec![marker; Frame::frame_size(4, 2)], 4, 2)
    }

    fn detection(class_name: &str) -> Detection {
        Detection {
            class_id: 3,
            class_name: class_name.to_string(),
            confidence: 0.8,
            bbox: [0.0, 0.0, 1.0, 1.0],
        }
    }

    fn supervisor_with(
        factory: SourceFactory,
        detector: Box<dyn Detector>,
    ) -> (
        PipelineSupervisor,
        Arc<FrameBridge>,
        Arc<SystemStatus>,
        Arc<PendingViolations>,
        CancellationToken,
    ) {
        let mut config = PpecamConfig::default();
        config.source.url = "stub://stream".to_string();
        let bridge = Arc::new(FrameBridge::new(Duration::from_millis(100)));
        let status = Arc::new(SystemStatus::new());
        let pending = Arc::new(PendingViolations::default());
        let cancel = CancellationToken::new();

        let supervisor = PipelineSupervisor::new(
            config,
            (4, 2),
            25.0,
            factory,
            detector,
            Arc::clone(&bridge),
            Arc::clone(&status),
            Arc::clone(&pending),
            cancel.clone(),
        )
        .with_timing(Duration::from_millis(50), Duration::from_secs(30));

        (supervisor, bridge, status, pending, cancel)
    }

    #[test]
    fn test_session_ends_cleanly_on_sentinel() {
        let factory: SourceFactory = Box::new(|| {
            Ok(Box::new(StubSource {
                frames: vec![test_frame(1), test_frame(2), test_frame(3)],
                fail_start: false,
            }))
        });
        let (mut supervisor, bridge, status, _, _) =
            supervisor_with(factory, Box::new(StubDetector { detections: vec![] }));

        let outcome = supervisor.run_session();
        assert_eq!(outcome, PipelineState::Ended);
        // All three frames were delivered to the bridge
        assert_eq!(bridge.stats().published, 3);
        // Source flag dropped on teardown
        assert!(!status.source_connected());
    }

    #[test]
    fn test_failed_start_reports_failed() {
        let factory: SourceFactory = Box::new(|| {
            Ok(Box::new(StubSource {
                frames: vec![],
                fail_start: true,
            }))
        });
        let (mut supervisor, bridge, status, _, _) =
            supervisor_with(factory, Box::new(StubDetector { detections: vec![] }));

        let outcome = supervisor.run_session();
        assert_eq!(outcome, PipelineState::Failed);
        assert_eq!(bridge.stats().published, 0);
        assert!(!status.source_connected());
    }

    #[test]
    fn test_violations_buffered_latest_wins() {
        let factory: SourceFactory = Box::new(|| {
            Ok(Box::new(StubSource {
                frames: vec![test_frame(1), test_frame(2)],
                fail_start: false,
            }))
        });
        let detector = StubDetector {
            detections: vec![detection("no-mask"), detection("mask"), detection("no-apron")],
        };
        let (mut supervisor, _, _, pending, _) = supervisor_with(factory, Box::new(detector));

        let outcome = supervisor.run_session();
        assert_eq!(outcome, PipelineState::Ended);

        let drained = pending.drain();
        assert_eq!(drained.len(), 2, "one slot per violation type");
        // The second frame's detections replaced the first frame's
        assert_eq!(drained["no-mask"].frame.data[0], 2);
        assert_eq!(drained["no-apron"].frame.data[0], 2);
    }

    #[test]
    fn test_restart_attempts_new_session_after_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory_attempts = Arc::clone(&attempts);
        let factory: SourceFactory = Box::new(move || {
            factory_attempts.fetch_add(1, Ordering::SeqCst);
            // A source that yields zero bytes on first read
            Ok(Box::new(StubSource {
                frames: vec![],
                fail_start: false,
            }))
        });
        let (supervisor, bridge, _, _, cancel) =
            supervisor_with(factory, Box::new(StubDetector { detections: vec![] }));

        let started = Instant::now();
        let handle = supervisor.spawn().unwrap();

        // Give the loop time for at least two sessions with a 50ms backoff
        while attempts.load(Ordering::SeqCst) < 2 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        cancel.cancel();
        handle.join().unwrap();

        assert!(attempts.load(Ordering::SeqCst) >= 2, "a new session was attempted");
        // No frame was ever delivered
        assert_eq!(bridge.stats().published, 0);
        // The second attempt cannot have started before one backoff elapsed
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
