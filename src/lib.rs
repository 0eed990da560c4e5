// Core building blocks
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod pool;
pub mod prebuffer;

// Feature modules
pub mod manager;
pub mod mjpeg;
pub mod motion;
pub mod recording;
pub mod server;
pub mod sse;

// Re-export common types at the crate root
pub use config::{CoopcamConfig, DetectionMode, SourceConfig, VideoQuality};
pub use error::{CoopcamError, Result};
pub use events::{MotionBus, MotionEvent, UpstreamEvent};
pub use frame::Frame;
pub use manager::{SourceSummary, StreamManager};
pub use mjpeg::{MjpegParser, MjpegProxy, PauseStatus};
pub use motion::{MotionEngine, WorkerPool};
pub use pool::FrameBufferPool;
pub use prebuffer::PreBuffer;
pub use recording::{ClipEncoder, FfmpegEncoder, MotionHistory, RecordingController};
pub use server::AppState;
pub use sse::SseBroadcaster;
