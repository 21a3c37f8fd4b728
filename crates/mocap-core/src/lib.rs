//! mocap-core: shared types and configuration for the marker fusion pipeline.
//! Pure data and math; no IO or async.

pub mod config;
pub mod error;
pub mod transform;
pub mod types;

pub use config::{
    Bounds, CameraCalibration, CameraConfig, CaptureConfig, DEFAULT_BOUNDS, OutputConfig,
    PipelineConfig, QueueConfig, SourceHandle,
};
pub use error::ConfigError;
pub use transform::ExtrinsicTransform;
pub use types::{
    CameraId, CameraSnapshot, ClientPoint, EstimatorMode, MarkerId, MarkerObservation, OutputMode,
    WorldPosition,
};
