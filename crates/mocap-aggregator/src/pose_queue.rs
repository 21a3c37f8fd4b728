//! Per-marker bounded history of world positions and the estimators that
//! fuse it into one expected pose.
//!
//! Pruning is lazy: entries past the age limit are dropped on `push` and on
//! every read, so no background eviction is needed.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use nalgebra::Vector3;

use mocap_core::{EstimatorMode, MarkerId, QueueConfig, WorldPosition};

use crate::pose_history::PoseSink;

// ─── Weights ────────────────────────────────────────────────────────

/// Geometric weights for `len` retained samples, oldest first.
///
/// `a1 = 1 - k*(len-1)/(capacity-1)`, `r = 1 - a1`, `w_i = a1 * r^(i-1)`.
/// The weights are not normalized: at `len == capacity` they sum to
/// `1 - k^capacity`. The oldest sample carries the largest weight.
pub fn geometric_weights(len: usize, capacity: usize, decay: f64) -> Vec<f64> {
    if len == 0 {
        return Vec::new();
    }
    let a1 = if capacity < 2 {
        1.0
    } else {
        1.0 - decay * (len as f64 - 1.0) / (capacity as f64 - 1.0)
    };
    let r = 1.0 - a1;
    (0..len).map(|i| a1 * r.powi(i as i32)).collect()
}

// ─── Internal ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct PoseSample {
    timestamp: DateTime<Utc>,
    position: WorldPosition,
}

// ─── PoseQueue ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PoseQueue {
    marker_id: MarkerId,
    /// Oldest first.
    samples: VecDeque<PoseSample>,
    capacity: usize,
    age_limit: TimeDelta,
    decay: f64,
    estimator: EstimatorMode,
}

impl PoseQueue {
    /// Create a queue seeded with the observation that first sighted the marker.
    pub fn new(
        marker_id: MarkerId,
        position: WorldPosition,
        timestamp: DateTime<Utc>,
        config: &QueueConfig,
    ) -> Self {
        let mut queue = Self {
            marker_id,
            samples: VecDeque::with_capacity(config.capacity.max(1)),
            capacity: config.capacity.max(1),
            age_limit: config.age_limit(),
            decay: config.decay,
            estimator: config.estimator,
        };
        queue.push(position, timestamp);
        queue
    }

    pub fn marker_id(&self) -> MarkerId {
        self.marker_id
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn estimator(&self) -> EstimatorMode {
        self.estimator
    }

    /// Timestamp of the newest retained sample.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.samples.iter().map(|s| s.timestamp).max()
    }

    /// Append a sample, evicting the oldest past capacity, then drop
    /// anything older than the age limit relative to `timestamp`.
    pub fn push(&mut self, position: WorldPosition, timestamp: DateTime<Utc>) {
        self.samples.push_back(PoseSample {
            timestamp,
            position,
        });
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        self.prune(timestamp);
    }

    /// Drop samples older than the age limit. Returns how many were removed.
    ///
    /// Cameras are not clock-synchronized, so samples are not guaranteed to
    /// be in timestamp order; every entry is checked.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        // An age limit reaching past the start of time keeps everything.
        let Some(cutoff) = now.checked_sub_signed(self.age_limit) else {
            return 0;
        };
        let before = self.samples.len();
        self.samples.retain(|s| s.timestamp >= cutoff);
        before - self.samples.len()
    }

    /// Fused position of the retained samples, or `None` once every sample
    /// has aged out.
    pub fn expected_pose(&mut self, now: DateTime<Utc>) -> Option<WorldPosition> {
        self.prune(now);
        if self.samples.is_empty() {
            return None;
        }
        let pose = match self.estimator {
            EstimatorMode::Geometric => self.geometric(),
            EstimatorMode::Mean => self.mean(),
        };
        Some(pose)
    }

    /// Like [`expected_pose`](Self::expected_pose), also appending the result
    /// to the history sink. Sink failures are logged by the writer and do
    /// not affect the returned pose or the queue.
    pub fn expected_pose_with_sink<S>(
        &mut self,
        now: DateTime<Utc>,
        sink: Option<&mut S>,
    ) -> Option<WorldPosition>
    where
        S: PoseSink + ?Sized,
    {
        let pose = self.expected_pose(now)?;
        if let Some(sink) = sink {
            sink.append(now, self.marker_id, &pose);
        }
        Some(pose)
    }

    fn geometric(&self) -> WorldPosition {
        let weights = geometric_weights(self.samples.len(), self.capacity, self.decay);
        self.samples
            .iter()
            .zip(weights)
            .fold(Vector3::zeros(), |acc, (s, w)| acc + s.position * w)
    }

    fn mean(&self) -> WorldPosition {
        let sum = self
            .samples
            .iter()
            .fold(Vector3::zeros(), |acc, s| acc + s.position);
        sum / self.samples.len() as f64
    }
}
