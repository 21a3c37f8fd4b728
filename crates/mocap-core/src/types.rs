use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fiducial marker id as decoded by the detector.
pub type MarkerId = u32;

/// Logical camera id (the key of the extrinsic table, not the device index).
pub type CameraId = u32;

/// A position in the shared world frame.
pub type WorldPosition = Vector3<f64>;

// ─── Observations ─────────────────────────────────────────────────

/// One marker seen by one camera in one detection cycle, already in world frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub marker_id: MarkerId,
    pub camera_id: CameraId,
    pub world_position: WorldPosition,
    pub timestamp: DateTime<Utc>,
}

/// The complete set of markers one camera currently sees.
///
/// Snapshots are immutable once published and replaced wholesale; readers
/// hold them behind an `Arc` and never see a half-written map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSnapshot {
    pub camera_id: CameraId,
    /// Strictly increasing per camera. The initial empty snapshot is 0.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub observations: BTreeMap<MarkerId, MarkerObservation>,
    /// True when the observations were carried over from an earlier frame
    /// because nothing was detected in this one.
    pub retained: bool,
}

impl CameraSnapshot {
    /// The snapshot a worker publishes before its first frame.
    pub fn empty(camera_id: CameraId, now: DateTime<Utc>) -> Self {
        Self {
            camera_id,
            seq: 0,
            captured_at: now,
            observations: BTreeMap::new(),
            retained: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn get(&self, marker_id: MarkerId) -> Option<&MarkerObservation> {
        self.observations.get(&marker_id)
    }
}

// ─── Client projection ────────────────────────────────────────────

/// A marker position in 2D client coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientPoint {
    pub x: f64,
    pub y: f64,
}

/// Which pair of world axes is projected onto the client plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Floor plan: (world.x, world.y).
    #[default]
    Xy,
    /// Elevation: (world.x, world.z), height becomes the client y axis.
    Xz,
}

impl OutputMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xy => "xy",
            Self::Xz => "xz",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xy" => Ok(Self::Xy),
            "xz" => Ok(Self::Xz),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// How a pose queue collapses its history into one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorMode {
    /// Unnormalized geometric series over insertion order.
    #[default]
    Geometric,
    /// Plain arithmetic mean of the retained samples.
    Mean,
}

impl EstimatorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Geometric => "geometric",
            Self::Mean => "mean",
        }
    }
}

impl fmt::Display for EstimatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstimatorMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "geometric" => Ok(Self::Geometric),
            "mean" => Ok(Self::Mean),
            _ => Err(ConfigError::InvalidEstimator(s.to_string())),
        }
    }
}
