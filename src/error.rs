//! Error types surfaced by the scanning pipeline

use thiserror::Error;

use crate::capture::frame::PixelFormat;

/// Errors reported to the host through `ScanSession::activate`.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Capture permission has not been granted. Recoverable: activate again
    /// once the host has obtained the grant.
    #[error("capture permission denied")]
    PermissionDenied,

    /// The capture device could not be bound. Fatal for the session.
    #[error("capture device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("scan session is already active")]
    AlreadyActive,

    /// The session reached `Decoded` or `Cancelled`; create a new one to scan again.
    #[error("scan session has finished")]
    SessionFinished,

    #[error("scan session must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl ScanError {
    pub fn device_unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        ScanError::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// Per-frame decode failure. Logged and treated as "no code in this frame".
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("pixel buffer too short: expected {expected} bytes, got {actual}")]
    MalformedBuffer { expected: usize, actual: usize },

    #[error("image decode failed: {0}")]
    Image(#[from] jpeg_decoder::Error),

    #[error("decode worker failed: {0}")]
    Worker(String),
}
