//! mocap-camera: camera IO boundary.
//! Capture and detection traits, the per-camera worker loop, and the
//! recorded-detection replay source.

pub mod error;
pub mod replay;
pub mod source;
pub mod worker;

pub use error::CameraError;
pub use replay::{RecordedDetector, RecordedFrame, ReplaySource, open_source};
pub use source::{Detection, FrameSource, MarkerDetector};
pub use worker::{CameraHandle, CameraWorker, SnapshotFeed, WorkerOptions, backoff_ticks};
