//! Error types for the camera IO boundary.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("frame capture failed: {0}")]
    CaptureFailed(String),

    #[error("marker detection failed: {0}")]
    DetectionFailed(String),

    #[error("capture + detect exceeded {0:?}")]
    Timeout(Duration),

    #[error("source is still busy with a previous read")]
    Busy,

    #[error("source reached end of stream")]
    EndOfStream,

    #[error("failed to parse recording line {line_num}: {detail}")]
    ParseError { line_num: usize, detail: String },

    #[error("no capture backend for device {0}")]
    UnsupportedDevice(u32),

    #[error("camera io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Whether the worker should keep looping after this error.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::EndOfStream)
    }
}
