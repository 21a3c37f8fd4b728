//! Fan-in state: routes camera snapshots into per-marker pose queues.
//!
//! `Aggregator` is pure and synchronous; the caller supplies snapshots and
//! the clock. [`crate::service::AggregatorService`] drives it on a timer.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use mocap_core::{CameraId, CameraSnapshot, MarkerId, QueueConfig, WorldPosition};

use crate::pose_history::PoseSink;
use crate::pose_queue::PoseQueue;

// ─── TickReport ─────────────────────────────────────────────────────

/// What one aggregator tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Snapshots offered to the tick.
    pub snapshots_read: usize,
    /// Snapshots not consumed by an earlier tick.
    pub snapshots_ingested: usize,
    pub observations_pushed: usize,
    pub queues_created: usize,
    /// Queues removed because every sample aged out.
    pub queues_expired: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.snapshots_ingested == 0 && self.queues_expired == 0
    }
}

// ─── Aggregator ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Aggregator {
    config: QueueConfig,
    queues: BTreeMap<MarkerId, PoseQueue>,
    /// Last snapshot `seq` consumed per camera.
    cursors: HashMap<CameraId, u64>,
    history: Option<Box<dyn PoseSink>>,
}

impl Aggregator {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: BTreeMap::new(),
            cursors: HashMap::new(),
            history: None,
        }
    }

    /// Append every expected pose read through
    /// [`snapshot_expected_poses`](Self::snapshot_expected_poses) to `sink`.
    #[must_use]
    pub fn with_history(mut self, sink: impl PoseSink + 'static) -> Self {
        self.history = Some(Box::new(sink));
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn queue(&self, marker_id: MarkerId) -> Option<&PoseQueue> {
        self.queues.get(&marker_id)
    }

    pub fn tracked_markers(&self) -> Vec<MarkerId> {
        self.queues.keys().copied().collect()
    }

    pub fn cursor(&self, camera_id: CameraId) -> Option<u64> {
        self.cursors.get(&camera_id).copied()
    }

    // ── Ingestion ─────────────────────────────────────────────────────

    /// Push every observation of a not-yet-consumed snapshot.
    ///
    /// Returns false when this camera's cursor is already at or past
    /// `snapshot.seq`, i.e. the tick is re-reading an unchanged snapshot.
    pub fn ingest_snapshot(&mut self, snapshot: &CameraSnapshot, report: &mut TickReport) -> bool {
        if let Some(&last) = self.cursors.get(&snapshot.camera_id) {
            if snapshot.seq <= last {
                return false;
            }
        }
        self.cursors.insert(snapshot.camera_id, snapshot.seq);
        report.snapshots_ingested += 1;

        for (&marker_id, obs) in &snapshot.observations {
            match self.queues.get_mut(&marker_id) {
                Some(queue) => queue.push(obs.world_position, obs.timestamp),
                None => {
                    self.queues.insert(
                        marker_id,
                        PoseQueue::new(marker_id, obs.world_position, obs.timestamp, &self.config),
                    );
                    report.queues_created += 1;
                }
            }
            report.observations_pushed += 1;
        }
        true
    }

    /// One fan-in pass over the latest snapshot of every camera.
    ///
    /// Snapshots are ingested in the order given; two cameras reporting the
    /// same marker both push. Queues that have fully aged out by `now` are
    /// dropped afterwards.
    pub fn tick<'a, I>(&mut self, snapshots: I, now: DateTime<Utc>) -> TickReport
    where
        I: IntoIterator<Item = &'a CameraSnapshot>,
    {
        let mut report = TickReport::default();
        for snapshot in snapshots {
            report.snapshots_read += 1;
            self.ingest_snapshot(snapshot, &mut report);
        }
        report.queues_expired = self.expire(now);
        report
    }

    /// Delete queues with no sample inside the age limit. Returns the count.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.queues.len();
        self.queues.retain(|_, queue| {
            queue.prune(now);
            !queue.is_empty()
        });
        before - self.queues.len()
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Copy of the current expected pose of every tracked marker.
    ///
    /// Markers whose samples have all aged out are omitted. When a history
    /// writer is attached each returned pose is also appended to it.
    pub fn snapshot_expected_poses(&mut self, now: DateTime<Utc>) -> BTreeMap<MarkerId, WorldPosition> {
        let mut poses = BTreeMap::new();
        for (&marker_id, queue) in self.queues.iter_mut() {
            if let Some(pose) = queue.expected_pose_with_sink(now, self.history.as_deref_mut()) {
                poses.insert(marker_id, pose);
            }
        }
        poses
    }
}
