use std::time::Duration;
use thiserror::Error;

/// Main error type for the coopcam system
#[derive(Error, Debug)]
pub enum CoopcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Motion worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Motion detection error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("System error: {message}")]
    System { message: String },
}

impl CoopcamError {
    /// Create a generic system error
    pub fn system<S: Into<String>>(message: S) -> Self {
        CoopcamError::System {
            message: message.into(),
        }
    }
}

/// Upstream/proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Upstream returned HTTP status {status}")]
    UpstreamStatus { status: u16 },

    #[error("Upstream is busy serving another client")]
    UpstreamBusy,

    #[error("Unexpected upstream content type: {content_type}")]
    UpstreamContentType { content_type: String },

    #[error("Upstream body ended")]
    UpstreamEnded,

    #[error("Upstream stalled: no frame boundary for {timeout:?}")]
    UpstreamStalled { timeout: Duration },

    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unknown source id: {id}")]
    UnknownSource { id: String },

    #[error("Proxy is disconnected")]
    Disconnected,
}

/// Worker pool error types
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error("Worker queue is full")]
    QueueFull,

    #[error("Worker task timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Worker {worker_id} crashed while processing a frame")]
    Crashed { worker_id: usize },

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Frame decode failed: {details}")]
    Decode { details: String },
}

/// Motion detection error types
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Frame dimensions changed: expected {expected}, got {actual} pixels")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Frame processing failed: {details}")]
    Processing { details: String },
}

/// Recording controller error types
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: String,
        source: std::io::Error,
    },

    #[error("Recording {id} has no frames to encode")]
    EmptyRecording { id: String },

    #[error("Metadata write failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// External encoder error types
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Failed to spawn encoder process `{binary}`: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("Encoder IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
}

/// HTTP server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to {address} on {platform}: {source}")]
    BindFailed {
        address: String,
        platform: &'static str,
        source: std::io::Error,
    },

    #[error("Server error: {details}")]
    Serve { details: String },
}

/// Result type alias using CoopcamError
pub type Result<T> = std::result::Result<T, CoopcamError>;
