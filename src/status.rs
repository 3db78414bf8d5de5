use crate::config::{OutputMode, SourceKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;

/// Thread-safe registry of subsystem health, shared between the capture
/// pipeline, the HTTP server, and the supervisory loop.
///
/// Every read and write goes through one mutex so snapshots are never torn.
pub struct SystemStatus {
    inner: Mutex<StatusInner>,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct StatusInner {
    detector_ready: bool,
    source_connected: bool,
    capture_alive: bool,
    active_clients: u32,
}

/// A fully-consistent view of the system status, shaped for the health
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: &'static str,
    pub mode: String,
    pub active_clients: u32,
    #[serde(rename = "camera_status")]
    pub source_connected: bool,
    #[serde(rename = "yolo_status")]
    pub detector_ready: bool,
    #[serde(rename = "streamer_status")]
    pub capture_alive: bool,
    pub source_type: String,
    pub uptime_seconds: f64,
}

impl SystemStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner::default()),
            started_at: Instant::now(),
        }
    }

    pub fn set_detector_ready(&self, ready: bool) {
        self.inner.lock().detector_ready = ready;
    }

    pub fn set_source_connected(&self, connected: bool) {
        self.inner.lock().source_connected = connected;
    }

    pub fn set_capture_alive(&self, alive: bool) {
        self.inner.lock().capture_alive = alive;
    }

    /// Record a new stream client; returns the updated count.
    pub fn client_connected(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.active_clients += 1;
        inner.active_clients
    }

    /// Record a stream client disconnect; returns the updated count.
    pub fn client_disconnected(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.active_clients = inner.active_clients.saturating_sub(1);
        inner.active_clients
    }

    pub fn active_clients(&self) -> u32 {
        self.inner.lock().active_clients
    }

    pub fn source_connected(&self) -> bool {
        self.inner.lock().source_connected
    }

    pub fn detector_ready(&self) -> bool {
        self.inner.lock().detector_ready
    }

    pub fn capture_alive(&self) -> bool {
        self.inner.lock().capture_alive
    }

    /// Take a consistent snapshot for the health endpoint.
    pub fn snapshot(&self, mode: OutputMode, source: SourceKind) -> StatusSnapshot {
        let inner = self.inner.lock();
        StatusSnapshot {
            status: "ok",
            mode: mode.to_string(),
            active_clients: inner.active_clients,
            source_connected: inner.source_connected,
            detector_ready: inner.detector_ready,
            capture_alive: inner.capture_alive,
            source_type: source.to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self::new()
    }
}
