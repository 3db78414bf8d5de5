use crate::config::{PpecamConfig, SourceKind};
use crate::error::{PpecamError, Result};
use crate::frame::Frame;
use crate::process::{terminate_child, TERMINATE_GRACE};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Capability set shared by all capture variants.
///
/// `read_frame` returning `Ok(None)` is the end-of-stream sentinel: the
/// current session is over and the supervisory loop should reconnect. It is
/// not an error.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<()>;
    fn read_frame(&mut self) -> Result<Option<Frame>>;
    fn stop(&mut self);
}

/// Factory used by the supervisory loop to construct a fresh source adapter
/// for each pipeline session.
pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn FrameSource>> + Send>;

/// Select the capture variant from configuration. Called once per session.
pub fn from_config(config: &PpecamConfig, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
    match config.source.kind {
        SourceKind::Url | SourceKind::File => Ok(Box::new(ProcessSource::new(
            config.source.locator(),
            width,
            height,
            &config.ffmpeg.protocol_whitelist,
            &config.ffmpeg.loglevel,
        ))),
        SourceKind::Webcam => {
            #[cfg(target_os = "linux")]
            {
                Ok(Box::new(DeviceSource::new(
                    config.source.webcam_index,
                    width,
                    height,
                )))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(PpecamError::source(
                    "webcam capture is only supported on linux",
                ))
            }
        }
    }
}

/// Capture variant fed by an external decoder process.
///
/// The decoder is configured for unbuffered, low-latency raw output at a
/// fixed pixel format; frames arrive as exact-size reads from its stdout.
pub struct ProcessSource {
    locator: String,
    width: u32,
    height: u32,
    frame_size: usize,
    protocol_whitelist: String,
    loglevel: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_reader: Option<JoinHandle<()>>,
}

impl ProcessSource {
    pub fn new(
        locator: &str,
        width: u32,
        height: u32,
        protocol_whitelist: &str,
        loglevel: &str,
    ) -> Self {
        Self {
            locator: locator.to_string(),
            width,
            height,
            frame_size: Frame::frame_size(width, height),
            protocol_whitelist: protocol_whitelist.to_string(),
            loglevel: loglevel.to_string(),
            child: None,
            stdout: None,
            stderr_reader: None,
        }
    }
}

impl FrameSource for ProcessSource {
    fn start(&mut self) -> Result<()> {
        let mut child = Command::new("ffmpeg")
            .args(["-protocol_whitelist", &self.protocol_whitelist])
            .args(["-i", &self.locator])
            .args(["-loglevel", &self.loglevel])
            .arg("-an")
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", "bgr24"])
            .args(["-vsync", "0"])
            .args(["-fflags", "nobuffer"])
            .args(["-flags", "low_delay"])
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PpecamError::source(format!("failed to spawn decoder: {}", e)))?;

        self.stdout = child.stdout.take();

        // Keep the decoder's stderr drained so it cannot block on a full
        // pipe buffer.
        if let Some(stderr) = child.stderr.take() {
            self.stderr_reader = Some(std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if !line.trim().is_empty() => warn!("[decoder] {}", line.trim()),
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }));
        }

        info!(
            locator = %self.locator,
            "decoder started ({}x{}, {} bytes/frame)",
            self.width,
            self.height,
            self.frame_size
        );

        self.child = Some(child);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; self.frame_size];
        match stdout.read_exact(&mut buf) {
            Ok(()) => Ok(Some(Frame::new(buf, self.width, self.height))),
            // A short read (zero bytes or a partial frame) means the stream
            // ended; nothing is ever delivered from a truncated frame.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stop(&mut self) {
        drop(self.stdout.take());

        if let Some(mut child) = self.child.take() {
            terminate_child(&mut child, TERMINATE_GRACE);
            info!(locator = %self.locator, "decoder stopped");
        }

        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture variant reading a local device synchronously.
///
/// The device must accept the pipeline's BGR24 format; a device that
/// negotiates anything else fails at `start()`, which the supervisory loop
/// treats as a restart trigger.
#[cfg(target_os = "linux")]
pub struct DeviceSource {
    index: u32,
    width: u32,
    height: u32,
    frame_size: usize,
    state: Option<linux::DeviceState>,
}

#[cfg(target_os = "linux")]
impl DeviceSource {
    pub fn new(index: u32, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            frame_size: Frame::frame_size(width, height),
            state: None,
        }
    }
}

#[cfg(target_os = "linux")]
impl FrameSource for DeviceSource {
    fn start(&mut self) -> Result<()> {
        let state = linux::open_device(self.index, self.width, self.height)?;
        info!(
            index = self.index,
            "capture device opened ({}x{})", self.width, self.height
        );
        self.state = Some(state);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };

        let data = match linux::capture(state) {
            Ok(data) => data,
            Err(e) => {
                warn!(index = self.index, "device read failed: {}", e);
                return Ok(None);
            }
        };

        if data.len() != self.frame_size {
            warn!(
                index = self.index,
                "short device read ({} of {} bytes)",
                data.len(),
                self.frame_size
            );
            return Ok(None);
        }

        Ok(Some(Frame::new(data, self.width, self.height)))
    }

    fn stop(&mut self) {
        if self.state.take().is_some() {
            info!(index = self.index, "capture device released");
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use crate::error::{PpecamError, Result};
    use ouroboros::self_referencing;
    use v4l::buffer::Type;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;

    #[self_referencing]
    pub struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    pub fn open_device(index: u32, width: u32, height: u32) -> Result<DeviceState> {
        let device = v4l::Device::new(index as usize)
            .map_err(|e| PpecamError::source(format!("failed to open device {}: {}", index, e)))?;

        let mut format = device
            .format()
            .map_err(|e| PpecamError::source(format!("failed to read device format: {}", e)))?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"BGR3");

        let negotiated = device
            .set_format(&format)
            .map_err(|e| PpecamError::source(format!("failed to set device format: {}", e)))?;

        if negotiated.fourcc != v4l::FourCC::new(b"BGR3") {
            return Err(PpecamError::source(format!(
                "device {} negotiated {} instead of BGR3",
                index, negotiated.fourcc
            )));
        }
        if negotiated.width != width || negotiated.height != height {
            return Err(PpecamError::source(format!(
                "device {} negotiated {}x{} instead of {}x{}",
                index, negotiated.width, negotiated.height, width, height
            )));
        }

        DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4).map_err(
                    |e| PpecamError::source(format!("failed to create capture stream: {}", e)),
                )
            },
        }
        .try_build()
    }

    pub fn capture(state: &mut DeviceState) -> std::io::Result<Vec<u8>> {
        let (buf, _meta) = state.with_mut(|fields| fields.stream.next())?;
        Ok(buf.to_vec())
    }
}
