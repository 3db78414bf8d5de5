pub mod backend;
pub mod bridge;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod hls;
pub mod probe;
pub mod process;
pub mod push;
pub mod server;
pub mod source;
pub mod status;
pub mod supervisor;
pub mod throttle;
pub mod violations;

pub use backend::{BackendClient, ViolationDetail};
pub use bridge::{FrameBridge, BridgeStatsSnapshot};
pub use config::{OutputMode, PpecamConfig, SourceKind};
pub use detect::{Detector, PassthroughDetector};
pub use error::{PpecamError, Result};
pub use frame::{Detection, Frame};
pub use hls::{RetentionManager, SegmentEncoder};
pub use probe::StreamProbe;
pub use push::MultipartEncoder;
pub use server::StreamServer;
pub use source::{FrameSource, ProcessSource, SourceFactory};
pub use status::{StatusSnapshot, SystemStatus};
pub use supervisor::{PipelineState, PipelineSupervisor};
pub use throttle::ViolationThrottle;
pub use violations::{PendingViolations, ViolationEvent, ViolationSubmitter};
