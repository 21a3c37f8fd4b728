//! Capture and detection seams. Both are external collaborators; the
//! worker only sees these traits so tests can inject fakes.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use mocap_core::{CameraCalibration, MarkerId};

use crate::error::CameraError;

/// One marker pose in camera-local coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub marker_id: MarkerId,
    #[serde(default)]
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

impl Detection {
    pub fn new(marker_id: MarkerId, tvec: Vector3<f64>) -> Self {
        Self {
            marker_id,
            rvec: Vector3::zeros(),
            tvec,
        }
    }
}

/// A live device or recorded stream producing frames.
///
/// `Err` is the "read did not succeed" case; the worker treats it as
/// transient unless it is [`CameraError::EndOfStream`].
pub trait FrameSource: Send + 'static {
    type Frame: Send + 'static;

    fn read(&mut self) -> Result<Self::Frame, CameraError>;
}

/// Turns a frame into marker poses.
pub trait MarkerDetector<F>: Send + Sync + 'static {
    fn detect(
        &self,
        frame: &F,
        calibration: &CameraCalibration,
    ) -> Result<Vec<Detection>, CameraError>;
}

impl<F, D: MarkerDetector<F> + ?Sized> MarkerDetector<F> for Box<D> {
    fn detect(
        &self,
        frame: &F,
        calibration: &CameraCalibration,
    ) -> Result<Vec<Detection>, CameraError> {
        (**self).detect(frame, calibration)
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    type Frame = S::Frame;

    fn read(&mut self) -> Result<Self::Frame, CameraError> {
        (**self).read()
    }
}
