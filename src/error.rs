use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum VideoError {
    #[error("Video device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Encoder launch failed: {0}")]
    EncoderLaunchFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, VideoError>;
