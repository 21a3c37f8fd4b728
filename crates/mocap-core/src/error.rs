//! Configuration errors shared across the pipeline crates.

use thiserror::Error;

use crate::types::CameraId;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid output mode {0:?} (expected \"xy\" or \"xz\")")]
    InvalidMode(String),

    #[error("invalid estimator {0:?} (expected \"geometric\" or \"mean\")")]
    InvalidEstimator(String),

    #[error("bounds need min < max on both axes, got [{0}, {1}, {2}, {3}]")]
    InvalidBounds(f64, f64, f64, f64),

    #[error("{name} must be a positive finite number, got {value}")]
    NotPositive { name: &'static str, value: f64 },

    #[error("{name} is out of the supported range, got {value}")]
    OutOfRange { name: &'static str, value: f64 },

    #[error("{0} must be finite")]
    NonFinite(&'static str),

    #[error("queue capacity must be at least 2, got {0}")]
    CapacityTooSmall(usize),

    #[error("decay constant must lie strictly between 0 and 1, got {0}")]
    DecayOutOfRange(f64),

    #[error("camera id {0} is configured more than once")]
    DuplicateCamera(CameraId),

    #[error("no cameras configured")]
    NoCameras,

    #[error("expected {expected} live camera sources, found {found}")]
    CameraCountMismatch { expected: usize, found: usize },
}
