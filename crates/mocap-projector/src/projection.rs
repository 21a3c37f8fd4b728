//! Output projection: world poses -> persistent 2D client points.
//!
//! Throttled to the output rate and independent of the aggregator cadence.
//! Client points are updated in place and never removed, so a marker that
//! stops being tracked keeps its last published position.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use mocap_core::{Bounds, ClientPoint, MarkerId, OutputConfig, OutputMode, WorldPosition};

// ─── Scale ──────────────────────────────────────────────────────────

/// Per-axis factor: configured span over default span.
fn axis_scale(min: f64, max: f64, default_min: f64, default_max: f64) -> f64 {
    let default_span = (default_max - default_min).abs();
    if default_span == 0.0 {
        return 1.0;
    }
    (max - min).abs() / default_span
}

/// Snap to the nearest multiple of `increment`, ties to the even multiple.
/// `-0.0` becomes `0.0`.
pub fn round_to_increment(value: f64, increment: f64) -> f64 {
    let snapped = if increment > 0.0 {
        (value / increment).round_ties_even() * increment
    } else {
        value
    };
    if snapped == 0.0 { 0.0 } else { snapped }
}

// ─── OutputProjector ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OutputProjector {
    mode: OutputMode,
    scale_x: f64,
    scale_y: f64,
    origin: [f64; 3],
    rounding: f64,
    period: TimeDelta,
    last_publish: Option<DateTime<Utc>>,
    points: BTreeMap<MarkerId, ClientPoint>,
}

impl OutputProjector {
    pub fn new(config: &OutputConfig) -> Self {
        let (scale_x, scale_y) = scales(&config.bounds, &config.default_bounds);
        let period = TimeDelta::from_std(config.publish_period()).unwrap_or(TimeDelta::zero());
        tracing::debug!(mode = %config.mode, scale_x, scale_y, "output projector configured");
        Self {
            mode: config.mode,
            scale_x,
            scale_y,
            origin: config.origin,
            rounding: config.rounding,
            period,
            last_publish: None,
            points: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn scales(&self) -> (f64, f64) {
        (self.scale_x, self.scale_y)
    }

    pub fn last_publish(&self) -> Option<DateTime<Utc>> {
        self.last_publish
    }

    /// True when at least one output period has elapsed since the last publish.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.last_publish
            .is_none_or(|last| now - last >= self.period)
    }

    /// Map one world position onto the client plane.
    pub fn project(&self, world: &WorldPosition) -> ClientPoint {
        let (second, second_origin) = match self.mode {
            OutputMode::Xy => (world.y, self.origin[1]),
            OutputMode::Xz => (world.z, self.origin[2]),
        };
        ClientPoint {
            x: round_to_increment(self.scale_x * (world.x - self.origin[0]), self.rounding),
            y: round_to_increment(self.scale_y * (second - second_origin), self.rounding),
        }
    }

    /// Fold `poses` into the client map regardless of throttling.
    pub fn apply(&mut self, poses: &BTreeMap<MarkerId, WorldPosition>, now: DateTime<Utc>) {
        for (&marker_id, world) in poses {
            let point = self.project(world);
            self.points
                .entry(marker_id)
                .and_modify(|p| *p = point)
                .or_insert(point);
        }
        self.last_publish = Some(now);
    }

    /// Recompute and return the client map if a publish is due.
    pub fn maybe_publish(
        &mut self,
        poses: &BTreeMap<MarkerId, WorldPosition>,
        now: DateTime<Utc>,
    ) -> Option<BTreeMap<MarkerId, ClientPoint>> {
        if !self.is_due(now) {
            return None;
        }
        self.apply(poses, now);
        Some(self.published_points())
    }

    /// Copy of every client point published so far.
    pub fn published_points(&self) -> BTreeMap<MarkerId, ClientPoint> {
        self.points.clone()
    }
}

fn scales(bounds: &Bounds, default: &Bounds) -> (f64, f64) {
    (
        axis_scale(bounds.min_x, bounds.max_x, default.min_x, default.max_x),
        axis_scale(bounds.min_y, bounds.max_y, default.min_y, default.max_y),
    )
}
