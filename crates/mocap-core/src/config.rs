//! Typed pipeline configuration.
//!
//! Every field has a default matching the reference classroom rig, so a
//! config file only needs to list cameras and whatever it overrides.
//! Parsing lives in the runtime; this module owns the record shapes and
//! their validation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transform::ExtrinsicTransform;
use crate::types::{CameraId, EstimatorMode, OutputMode};

/// Shortest loop period a rate may ask for.
pub const MIN_PERIOD: Duration = Duration::from_micros(100);

/// Longest accepted pose age limit (one day).
pub const MAX_AGE_LIMIT_SECS: f64 = 86_400.0;

/// Bounds the client plane was designed around, in world units (cm).
pub const DEFAULT_BOUNDS: Bounds = Bounds {
    min_x: -300.0,
    max_x: 300.0,
    min_y: -200.0,
    max_y: 200.0,
};

/// Printed marker edge length in cm.
pub const DEFAULT_MARKER_LENGTH: f64 = 18.0;

const DEFAULT_CAMERA_MATRIX: [[f64; 3]; 3] = [
    [589.2678740465893, 0.0, 360.7562954333174],
    [0.0, 588.3283124033934, 229.65330113945927],
    [0.0, 0.0, 1.0],
];

const DEFAULT_DIST_COEFFS: [f64; 5] = [
    -0.4003160209939034,
    0.057038417288267244,
    -0.00021952153111566165,
    -0.002627009754899686,
    0.1850395020517708,
];

// ─── Bounds ─────────────────────────────────────────────────────────

/// Axis-aligned client bounds, (de)serialized as `[min_x, max_x, min_y, max_y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Bounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        (self.max_x - self.min_x).abs()
    }

    pub fn height(&self) -> f64 {
        (self.max_y - self.min_y).abs()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [self.min_x, self.max_x, self.min_y, self.max_y]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.min_x >= self.max_x || self.min_y >= self.max_y {
            return Err(ConfigError::InvalidBounds(
                self.min_x, self.max_x, self.min_y, self.max_y,
            ));
        }
        Ok(())
    }
}

impl Default for Bounds {
    fn default() -> Self {
        DEFAULT_BOUNDS
    }
}

impl From<[f64; 4]> for Bounds {
    fn from(v: [f64; 4]) -> Self {
        Self {
            min_x: v[0],
            max_x: v[1],
            min_y: v[2],
            max_y: v[3],
        }
    }
}

impl From<Bounds> for [f64; 4] {
    fn from(b: Bounds) -> Self {
        [b.min_x, b.max_x, b.min_y, b.max_y]
    }
}

// ─── Cameras ────────────────────────────────────────────────────────

/// Where a camera's frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceHandle {
    /// A live capture device by index.
    Device { index: u32 },
    /// A recorded detection log on disk.
    Recording { path: PathBuf },
}

/// Per-camera record: identity, source, intrinsics and extrinsics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    pub source: SourceHandle,
    #[serde(default = "default_camera_matrix")]
    pub camera_matrix: [[f64; 3]; 3],
    #[serde(default = "default_dist_coeffs")]
    pub dist_coeffs: Vec<f64>,
    /// Matrix for the undistorted image; falls back to `camera_matrix`.
    #[serde(default)]
    pub rectified_matrix: Option<[[f64; 3]; 3]>,
    /// Camera-to-world transform. `None` leaves observations in camera frame.
    #[serde(default)]
    pub extrinsic: Option<ExtrinsicTransform>,
    /// Whether this camera's raw stream should be recorded by an external recorder.
    #[serde(default)]
    pub save: bool,
}

impl CameraConfig {
    pub fn new(id: CameraId, source: SourceHandle) -> Self {
        Self {
            id,
            source,
            camera_matrix: default_camera_matrix(),
            dist_coeffs: default_dist_coeffs(),
            rectified_matrix: None,
            extrinsic: None,
            save: false,
        }
    }

    #[must_use]
    pub fn with_extrinsic(mut self, extrinsic: ExtrinsicTransform) -> Self {
        self.extrinsic = Some(extrinsic);
        self
    }

    /// Everything a detector needs to estimate marker poses for this camera.
    pub fn calibration(&self, marker_length: f64) -> CameraCalibration {
        let camera_matrix = matrix3(&self.camera_matrix);
        CameraCalibration {
            camera_matrix,
            dist_coeffs: self.dist_coeffs.clone(),
            rectified_matrix: self
                .rectified_matrix
                .as_ref()
                .map_or(camera_matrix, matrix3),
            marker_length,
        }
    }
}

/// Intrinsics handed to the external marker detector.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCalibration {
    pub camera_matrix: Matrix3<f64>,
    pub dist_coeffs: Vec<f64>,
    pub rectified_matrix: Matrix3<f64>,
    pub marker_length: f64,
}

fn matrix3(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| rows[r][c])
}

fn default_camera_matrix() -> [[f64; 3]; 3] {
    DEFAULT_CAMERA_MATRIX
}

fn default_dist_coeffs() -> Vec<f64> {
    DEFAULT_DIST_COEFFS.to_vec()
}

// ─── Stage configs ──────────────────────────────────────────────────

/// Capture-loop settings shared by every camera worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub frame_rate_hz: f64,
    /// Upper bound on one capture + detect call before it counts as failed.
    pub read_timeout_ms: u64,
    /// Keep publishing the last seen markers when a frame has no detections.
    pub keep_old_values: bool,
    pub marker_length: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 10.0,
            read_timeout_ms: 500,
            keep_old_values: false,
            marker_length: DEFAULT_MARKER_LENGTH,
        }
    }
}

impl CaptureConfig {
    pub fn frame_period(&self) -> Duration {
        rate_period(self.frame_rate_hz)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Pose queue bounds and estimator selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub age_limit_secs: f64,
    pub decay: f64,
    pub estimator: EstimatorMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            age_limit_secs: 3.0,
            decay: 0.95,
            estimator: EstimatorMode::Geometric,
        }
    }
}

impl QueueConfig {
    pub fn age_limit(&self) -> TimeDelta {
        TimeDelta::microseconds((self.age_limit_secs * 1_000_000.0) as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity < 2 {
            return Err(ConfigError::CapacityTooSmall(self.capacity));
        }
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(ConfigError::DecayOutOfRange(self.decay));
        }
        positive("age_limit_secs", self.age_limit_secs)?;
        if self.age_limit_secs > MAX_AGE_LIMIT_SECS {
            return Err(ConfigError::OutOfRange {
                name: "age_limit_secs",
                value: self.age_limit_secs,
            });
        }
        Ok(())
    }
}

/// Client projection and publish cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub mode: OutputMode,
    pub bounds: Bounds,
    /// Bounds the scale factors are measured against.
    pub default_bounds: Bounds,
    /// World point that maps to the client origin.
    pub origin: [f64; 3],
    pub rounding: f64,
    pub rate_hz: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Xy,
            bounds: DEFAULT_BOUNDS,
            default_bounds: DEFAULT_BOUNDS,
            origin: [0.0, 0.0, 0.0],
            rounding: 1.0,
            rate_hz: 15.0,
        }
    }
}

impl OutputConfig {
    pub fn publish_period(&self) -> Duration {
        rate_period(self.rate_hz)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bounds.validate()?;
        self.default_bounds.validate()?;
        positive("rounding", self.rounding)?;
        rate("output rate_hz", self.rate_hz)?;
        if !self.origin.iter().all(|v| v.is_finite()) {
            return Err(ConfigError::NonFinite("origin"));
        }
        Ok(())
    }
}

// ─── PipelineConfig ─────────────────────────────────────────────────

/// Top-level configuration for one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many live sources must be found at startup. Defaults to `cameras.len()`.
    pub camera_count: Option<usize>,
    pub cameras: Vec<CameraConfig>,
    pub capture: CaptureConfig,
    pub queue: QueueConfig,
    pub aggregator_rate_hz: f64,
    pub output: OutputConfig,
    /// Directory for the pose history CSV. `None` disables persistence.
    pub pose_history_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera_count: None,
            cameras: Vec::new(),
            capture: CaptureConfig::default(),
            queue: QueueConfig::default(),
            aggregator_rate_hz: 10.0,
            output: OutputConfig::default(),
            pose_history_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn expected_camera_count(&self) -> usize {
        self.camera_count.unwrap_or(self.cameras.len())
    }

    pub fn tick_period(&self) -> Duration {
        rate_period(self.aggregator_rate_hz)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        rate("frame_rate_hz", self.capture.frame_rate_hz)?;
        rate("aggregator_rate_hz", self.aggregator_rate_hz)?;
        positive("marker_length", self.capture.marker_length)?;
        if self.capture.read_timeout_ms == 0 {
            return Err(ConfigError::NotPositive {
                name: "read_timeout_ms",
                value: 0.0,
            });
        }
        self.queue.validate()?;
        self.output.validate()?;

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(ConfigError::DuplicateCamera(camera.id));
            }
        }
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        Ok(())
    }

    /// Fail startup when fewer sources came up than the rig expects.
    pub fn ensure_camera_count(&self, found: usize) -> Result<(), ConfigError> {
        let expected = self.expected_camera_count();
        if found < expected {
            return Err(ConfigError::CameraCountMismatch { expected, found });
        }
        Ok(())
    }
}

/// Period of a positive rate, saturating instead of panicking on rates
/// `Duration` cannot represent. Never zero.
fn rate_period(rate_hz: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate_hz)
        .unwrap_or(Duration::MAX)
        .max(MIN_PERIOD)
}

/// A rate must be positive and its period must fit a `Duration` of at
/// least [`MIN_PERIOD`].
fn rate(name: &'static str, value: f64) -> Result<(), ConfigError> {
    positive(name, value)?;
    match Duration::try_from_secs_f64(1.0 / value) {
        Ok(period) if period >= MIN_PERIOD => Ok(()),
        _ => Err(ConfigError::OutOfRange { name, value }),
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(id: CameraId) -> CameraConfig {
        CameraConfig::new(
            id,
            SourceHandle::Recording {
                path: PathBuf::from(format!("cam{id}.ndjson")),
            },
        )
    }

    #[test]
    fn defaults_validate_once_a_camera_is_listed() {
        let cfg = PipelineConfig {
            cameras: vec![recording(1)],
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.queue.capacity, 30);
        assert_eq!(cfg.output.rate_hz, 15.0);
        assert_eq!(cfg.output.bounds, DEFAULT_BOUNDS);
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let json = r#"{
            "cameras": [
                {"id": 1, "source": {"kind": "recording", "path": "a.ndjson"}}
            ],
            "output": {"mode": "xz", "bounds": [-100, 100, -50, 50]}
        }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].dist_coeffs.len(), 5);
        assert!(cfg.cameras[0].extrinsic.is_none());
        assert_eq!(cfg.output.mode, OutputMode::Xz);
        assert_eq!(cfg.output.bounds.width(), 200.0);
        assert_eq!(cfg.output.rounding, 1.0);
        assert_eq!(cfg.expected_camera_count(), 1);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut cfg = PipelineConfig::default();
        cfg.output.bounds = Bounds::from([100.0, -100.0, -50.0, 50.0]);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidBounds(..))
        ));
    }

    #[test]
    fn rejects_zero_rounding() {
        let mut cfg = PipelineConfig::default();
        cfg.output.rounding = 0.0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive {
                name: "rounding",
                value: 0.0
            })
        );
    }

    #[test]
    fn rejects_capacity_below_two() {
        let mut cfg = PipelineConfig::default();
        cfg.queue.capacity = 1;
        assert_eq!(cfg.validate(), Err(ConfigError::CapacityTooSmall(1)));
    }

    #[test]
    fn rejects_decay_outside_unit_interval() {
        let mut cfg = PipelineConfig::default();
        cfg.queue.decay = 1.0;
        assert_eq!(cfg.validate(), Err(ConfigError::DecayOutOfRange(1.0)));
    }

    #[test]
    fn rejects_duplicate_camera_ids() {
        let cfg = PipelineConfig {
            cameras: vec![recording(2), recording(2)],
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicateCamera(2)));
    }

    #[test]
    fn camera_count_mismatch_is_fatal() {
        let cfg = PipelineConfig {
            camera_count: Some(4),
            cameras: vec![recording(1), recording(2), recording(3), recording(4)],
            ..PipelineConfig::default()
        };
        assert_eq!(
            cfg.ensure_camera_count(3),
            Err(ConfigError::CameraCountMismatch {
                expected: 4,
                found: 3
            })
        );
        assert!(cfg.ensure_camera_count(4).is_ok());
    }

    #[test]
    fn rejects_config_without_cameras() {
        assert_eq!(
            PipelineConfig::default().validate(),
            Err(ConfigError::NoCameras)
        );
    }

    #[test]
    fn rejects_rates_without_a_representable_period() {
        let mut cfg = PipelineConfig {
            cameras: vec![recording(1)],
            ..PipelineConfig::default()
        };
        cfg.capture.frame_rate_hz = 1e-20;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                name: "frame_rate_hz",
                value: 1e-20
            })
        );

        cfg.capture.frame_rate_hz = 10.0;
        cfg.output.rate_hz = 1e12;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { name: "output rate_hz", .. })
        ));
    }

    #[test]
    fn extreme_rates_saturate_instead_of_panicking() {
        let capture = CaptureConfig {
            frame_rate_hz: 1e-20,
            ..CaptureConfig::default()
        };
        assert_eq!(capture.frame_period(), Duration::MAX);

        let output = OutputConfig {
            rate_hz: 1e12,
            ..OutputConfig::default()
        };
        assert_eq!(output.publish_period(), MIN_PERIOD);
    }

    #[test]
    fn rejects_huge_age_limit() {
        let queue = QueueConfig {
            age_limit_secs: 1e13,
            ..QueueConfig::default()
        };
        assert!(matches!(
            queue.validate(),
            Err(ConfigError::OutOfRange { name: "age_limit_secs", .. })
        ));
    }

    #[test]
    fn calibration_falls_back_to_camera_matrix() {
        let cal = recording(1).calibration(18.0);
        assert_eq!(cal.camera_matrix, cal.rectified_matrix);
        assert_eq!(cal.camera_matrix[(0, 2)], 360.7562954333174);
        assert_eq!(cal.marker_length, 18.0);
    }

    #[test]
    fn periods_follow_rates() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.capture.frame_period(), Duration::from_millis(100));
        assert_eq!(cfg.tick_period(), Duration::from_millis(100));
        assert_eq!(cfg.queue.age_limit(), TimeDelta::seconds(3));
    }
}
