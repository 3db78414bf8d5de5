use crate::config::FfmpegConfig;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Dimensions returned when the probe cannot determine the real ones.
pub const DEFAULT_DIMENSIONS: (u32, u32) = (1280, 720);
/// Frame rate returned when the probe cannot determine the real one.
pub const DEFAULT_FPS: f64 = 25.0;

/// One-shot inspection of a stream locator via the probe tool.
///
/// Probing is best-effort: any failure (spawn error, non-zero exit,
/// unparsable output, timeout) falls back to fixed defaults instead of
/// failing the caller.
pub struct StreamProbe {
    tool: String,
    protocol_whitelist: String,
    timeout: Duration,
}

impl StreamProbe {
    pub fn new(config: &FfmpegConfig) -> Self {
        Self::with_tool(
            "ffprobe",
            &config.protocol_whitelist,
            Duration::from_secs(config.probe_timeout_seconds),
        )
    }

    pub fn with_tool(tool: &str, protocol_whitelist: &str, timeout: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            protocol_whitelist: protocol_whitelist.to_string(),
            timeout,
        }
    }

    /// Probe the stream's `(width, height)`, falling back to 1280x720.
    pub fn dimensions(&self, locator: &str) -> (u32, u32) {
        match self
            .query(locator, "stream=width,height")
            .and_then(|line| parse_dimensions(&line))
        {
            Some(dims) => dims,
            None => {
                warn!(
                    locator,
                    "could not probe stream dimensions, using {}x{}",
                    DEFAULT_DIMENSIONS.0,
                    DEFAULT_DIMENSIONS.1
                );
                DEFAULT_DIMENSIONS
            }
        }
    }

    /// Probe the stream's frame rate, falling back to 25.0.
    pub fn frame_rate(&self, locator: &str) -> f64 {
        match self
            .query(locator, "stream=r_frame_rate")
            .and_then(|line| parse_frame_rate(&line))
        {
            Some(fps) => fps,
            None => {
                warn!(locator, "could not probe frame rate, using {}", DEFAULT_FPS);
                DEFAULT_FPS
            }
        }
    }

    /// Run the probe tool and return the first non-empty stdout line.
    ///
    /// The tool may emit the requested fields on one or multiple lines;
    /// only the first valid line is used.
    fn query(&self, locator: &str, entries: &str) -> Option<String> {
        let mut child = match Command::new(&self.tool)
            .args(["-protocol_whitelist", &self.protocol_whitelist])
            .args(["-v", "error"])
            .args(["-select_streams", "v:0"])
            .args(["-show_entries", entries])
            .args(["-of", "csv=s=x:p=0"])
            .arg(locator)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!("failed to spawn probe tool {}: {}", self.tool, e);
                return None;
            }
        };

        // Drain stdout off-thread so a chatty tool cannot fill the pipe
        // while we poll for exit.
        let mut stdout = child.stdout.take()?;
        let reader = std::thread::spawn(move || {
            let mut output = String::new();
            let _ = stdout.read_to_string(&mut output);
            output
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(locator, "probe timed out after {:?}", self.timeout);
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = reader.join();
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    debug!("failed to poll probe process: {}", e);
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = reader.join();
                    return None;
                }
            }
        };

        let output = reader.join().unwrap_or_default();
        if !status.success() {
            debug!(locator, %status, "probe exited with failure");
            return None;
        }

        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// Parse `WIDTHxHEIGHT` (first comma-separated field of the line).
fn parse_dimensions(line: &str) -> Option<(u32, u32)> {
    let field = line.split(',').next()?;
    let (width, height) = field.split_once('x')?;
    let width = width.trim().parse().ok()?;
    let height = height.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Parse a `NUM/DEN` rational frame rate (first comma-separated field).
fn parse_frame_rate(line: &str) -> Option<f64> {
    let field = line.split(',').next()?;
    let (num, den) = field.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("1280x720"), Some((1280, 720)));
        assert_eq!(parse_dimensions("1920x1080,extra"), Some((1920, 1080)));
        assert_eq!(parse_dimensions("garbage"), None);
        assert_eq!(parse_dimensions("0x720"), None);
        assert_eq!(parse_dimensions(""), None);
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("not-a-rate"), None);
    }

    #[test]
    fn test_missing_tool_falls_back_to_defaults() {
        let probe = StreamProbe::with_tool(
            "/nonexistent/ffprobe",
            "file,http,https,tcp,tls,crypto",
            Duration::from_secs(1),
        );
        assert_eq!(probe.dimensions("rtsp://example/stream"), DEFAULT_DIMENSIONS);
        assert_eq!(probe.frame_rate("rtsp://example/stream"), DEFAULT_FPS);
    }

    #[test]
    #[cfg(unix)]
    fn test_probe_reads_first_valid_line() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fakeprobe");
        {
            let mut f = std::fs::File::create(&script).unwrap();
            writeln!(f, "#!/bin/sh").unwrap();
            writeln!(f, "echo 640x360").unwrap();
            writeln!(f, "echo 1920x1080").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = StreamProbe::with_tool(
            script.to_str().unwrap(),
            "file",
            Duration::from_secs(5),
        );
        assert_eq!(probe.dimensions("anything"), (640, 360));
    }

    #[test]
    #[cfg(unix)]
    fn test_probe_timeout_falls_back() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slowprobe");
        {
            let mut f = std::fs::File::create(&script).unwrap();
            writeln!(f, "#!/bin/sh").unwrap();
            writeln!(f, "sleep 5").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = StreamProbe::with_tool(
            script.to_str().unwrap(),
            "file",
            Duration::from_millis(100),
        );
        let started = Instant::now();
        assert_eq!(probe.dimensions("anything"), DEFAULT_DIMENSIONS);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
