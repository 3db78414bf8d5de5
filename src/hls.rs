use crate::config::OutputConfig;
use crate::error::{PpecamError, Result};
use crate::frame::Frame;
use crate::process::{terminate_child, TERMINATE_GRACE};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Segmented delivery sink: feeds raw frames to an external encoder process
/// that manages segment rotation and playlist rewriting itself.
///
/// One encoder process lives per pipeline session; a restart constructs a
/// fresh one.
pub struct SegmentEncoder {
    width: u32,
    height: u32,
    fps: f64,
    output_dir: PathBuf,
    playlist_path: PathBuf,
    segment_seconds: u32,
    playlist_size: u32,
    delete_threshold: u32,
    loglevel: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_reader: Option<JoinHandle<()>>,
}

impl SegmentEncoder {
    pub fn new(output: &OutputConfig, loglevel: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            output_dir: PathBuf::from(&output.output_dir),
            playlist_path: output.playlist_path(),
            segment_seconds: output.segment_seconds,
            playlist_size: output.playlist_size,
            delete_threshold: output.delete_threshold,
            loglevel: loglevel.to_string(),
            child: None,
            stdin: None,
            stderr_reader: None,
        }
    }

    /// Launch the encoder process with a raw-frame stdin pipe.
    pub fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;

        let segment_pattern = self.output_dir.join("stream%d.ts");
        let keyframe_interval = (self.fps * 2.0).round().max(1.0) as u32;

        let mut child = Command::new("ffmpeg")
            .args(["-loglevel", &self.loglevel])
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", "bgr24"])
            .args(["-s", &format!("{}x{}", self.width, self.height)])
            .args(["-r", &self.fps.to_string()])
            .args(["-i", "-"])
            .args(["-c:v", "libx264"])
            .args(["-preset", "veryfast"])
            .args(["-tune", "zerolatency"])
            .args(["-profile:v", "baseline"])
            .args(["-level", "3.0"])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-g", &keyframe_interval.to_string()])
            .args(["-sc_threshold", "0"])
            .args(["-hls_time", &self.segment_seconds.to_string()])
            .args(["-hls_list_size", &self.playlist_size.to_string()])
            .args(["-hls_flags", "delete_segments"])
            .args(["-hls_delete_threshold", &self.delete_threshold.to_string()])
            .arg("-hls_segment_filename")
            .arg(&segment_pattern)
            .args(["-f", "hls"])
            .arg(&self.playlist_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PpecamError::encoder(format!("failed to spawn encoder: {}", e)))?;

        self.stdin = child.stdin.take();

        // Drain stderr continuously so the encoder can never stall on a
        // full pipe buffer.
        if let Some(stderr) = child.stderr.take() {
            self.stderr_reader = Some(std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if !line.trim().is_empty() => warn!("[encoder] {}", line.trim()),
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }));
        }

        info!(
            playlist = %self.playlist_path.display(),
            "segment encoder started ({}x{} @ {:.2} fps)",
            self.width,
            self.height,
            self.fps
        );

        self.child = Some(child);
        Ok(())
    }

    /// Write one annotated frame's raw bytes to the encoder's input pipe.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PpecamError::encoder("encoder is not running"))?;

        stdin.write_all(&frame.data).map_err(|e| {
            warn!("failed to write frame to encoder: {}", e);
            PpecamError::encoder(format!("encoder pipe write failed: {}", e))
        })
    }

    /// Stop the encoder: close the input pipe first so it can flush its
    /// final segment, then terminate with a bounded wait and kill fallback.
    ///
    /// Idempotent; safe to call on a never-started or already-stopped sink.
    pub fn stop(&mut self) {
        drop(self.stdin.take());

        if let Some(mut child) = self.child.take() {
            terminate_child(&mut child, TERMINATE_GRACE);
            info!("segment encoder stopped");
        }

        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for SegmentEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Check that a playlist file is well-formed: it carries the format header
/// marker and references at least one segment.
pub fn is_playlist_valid(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(content) => content.contains("#EXTM3U") && content.contains(".ts"),
        Err(_) => false,
    }
}

/// Secondary safeguard against orphaned segments.
///
/// The encoder's own list-size/delete-threshold settings are the primary
/// retention mechanism; this manager prunes anything the encoder left
/// behind.
pub struct RetentionManager {
    output_dir: PathBuf,
    keep_count: usize,
}

impl RetentionManager {
    pub fn new<P: Into<PathBuf>>(output_dir: P, keep_count: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            keep_count,
        }
    }

    /// Delete all but the newest `keep_count` segment files, ordered by the
    /// sequence number embedded in the filename. Returns the number of
    /// files removed. Never fatal: errors are logged and skipped.
    pub fn cleanup_old_segments(&self) -> usize {
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    dir = %self.output_dir.display(),
                    "retention scan failed: {}", e
                );
                return 0;
            }
        };

        let mut segments: Vec<(u64, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let seq = segment_sequence(&path)?;
                Some((seq, path))
            })
            .collect();

        if segments.len() <= self.keep_count {
            return 0;
        }

        segments.sort_by_key(|(seq, _)| *seq);

        let excess = segments.len() - self.keep_count;
        let mut removed = 0;
        for (seq, path) in &segments[..excess] {
            match fs::remove_file(path) {
                Ok(()) => {
                    info!(sequence = seq, "removed old segment {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("failed to remove segment {}: {}", path.display(), e),
            }
        }
        removed
    }
}

/// Extract the sequence number from a `stream<N>.ts` filename.
fn segment_sequence(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("stream")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

/// Remove leftover files from the output directory so each run starts with
/// a fresh playlist. Returns the number of files removed.
pub fn clean_output_dir(dir: &Path) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::write(path, b"segment-data").unwrap();
    }

    #[test]
    fn test_retention_deletes_oldest_segments() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..15 {
            touch(&dir.path().join(format!("stream{}.ts", i)));
        }

        let manager = RetentionManager::new(dir.path(), 11);
        assert_eq!(manager.cleanup_old_segments(), 4);

        for i in 0..4 {
            assert!(
                !dir.path().join(format!("stream{}.ts", i)).exists(),
                "stream{}.ts should have been deleted",
                i
            );
        }
        for i in 4..15 {
            assert!(
                dir.path().join(format!("stream{}.ts", i)).exists(),
                "stream{}.ts should have been kept",
                i
            );
        }
    }

    #[test]
    fn test_retention_orders_numerically_not_lexically() {
        let dir = tempfile::tempdir().unwrap();
        // Lexically, "stream10.ts" sorts before "stream2.ts"
        for i in [2u64, 10, 100] {
            touch(&dir.path().join(format!("stream{}.ts", i)));
        }

        let manager = RetentionManager::new(dir.path(), 2);
        assert_eq!(manager.cleanup_old_segments(), 1);
        assert!(!dir.path().join("stream2.ts").exists());
        assert!(dir.path().join("stream10.ts").exists());
        assert!(dir.path().join("stream100.ts").exists());
    }

    #[test]
    fn test_retention_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("stream0.ts"));
        touch(&dir.path().join("stream.m3u8"));
        touch(&dir.path().join("notes.txt"));

        let manager = RetentionManager::new(dir.path(), 0);
        assert_eq!(manager.cleanup_old_segments(), 1);
        assert!(dir.path().join("stream.m3u8").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_retention_under_threshold_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            touch(&dir.path().join(format!("stream{}.ts", i)));
        }

        let manager = RetentionManager::new(dir.path(), 11);
        assert_eq!(manager.cleanup_old_segments(), 0);
    }

    #[test]
    fn test_playlist_validity() {
        let dir = tempfile::tempdir().unwrap();
        let playlist = dir.path().join("stream.m3u8");

        assert!(!is_playlist_valid(&playlist));

        fs::write(&playlist, "#EXTM3U\n#EXT-X-VERSION:3\n").unwrap();
        assert!(!is_playlist_valid(&playlist));

        fs::write(
            &playlist,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:10.0,\nstream0.ts\n",
        )
        .unwrap();
        assert!(is_playlist_valid(&playlist));
    }

    #[test]
    fn test_clean_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("stream0.ts"));
        touch(&dir.path().join("stream.m3u8"));

        assert_eq!(clean_output_dir(dir.path()).unwrap(), 2);
        assert_eq!(clean_output_dir(dir.path()).unwrap(), 0);

        let missing = dir.path().join("does-not-exist");
        assert_eq!(clean_output_dir(&missing).unwrap(), 0);
    }

    #[test]
    fn test_segment_sequence_parsing() {
        assert_eq!(segment_sequence(Path::new("/out/stream7.ts")), Some(7));
        assert_eq!(segment_sequence(Path::new("/out/stream123.ts")), Some(123));
        assert_eq!(segment_sequence(Path::new("/out/stream.m3u8")), None);
        assert_eq!(segment_sequence(Path::new("/out/other0.ts")), None);
    }
}
