//! Capture error taxonomy.
//!
//! Every variant here is fatal to the operation that produced it. The two
//! expected outcomes of a non-blocking read ("no frame yet" and end of
//! stream) are not errors; they are reported through
//! [`ReadStatus`](crate::session::ReadStatus).

use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the capture core.
pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Device missing, permission denied, or no supported format found.
    #[error("failed to open device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    /// The requested format was rejected and no fallback exists.
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),

    #[error("device refused to start streaming: {0}")]
    StreamStart(String),

    #[error("device refused to stop streaming: {0}")]
    StreamStop(String),

    /// No buffer became ready within the wait window. The device is
    /// considered stalled or disconnected.
    #[error("no buffer became ready within {0:?}")]
    PollTimeout(Duration),

    /// Unexpected failure while requesting, mapping, queueing or dequeueing
    /// a capture buffer.
    #[error("buffer protocol failure during {operation}: {reason}")]
    BufferProtocol {
        operation: &'static str,
        reason: String,
    },

    #[error("capture is not running")]
    NotCapturing,

    /// Returned by blocking reads only; non-blocking reads report end of
    /// stream as a status.
    #[error("end of stream")]
    EndOfStream,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CaptureError {
    pub(crate) fn device_open(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceOpen {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(operation: &'static str, reason: impl ToString) -> Self {
        Self::BufferProtocol {
            operation,
            reason: reason.to_string(),
        }
    }
}
