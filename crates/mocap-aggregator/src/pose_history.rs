//! Append-only CSV log of published expected poses.
//!
//! Line format: `timestamp_ms,marker_id,x,y,z`. Write failures are logged
//! and counted, never returned; losing history must not stall tracking.
//! Inside the pipeline the writer runs on the blocking pool behind a
//! [`QueuedPoseSink`], so the aggregator tick never waits on the disk.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mocap_core::{MarkerId, WorldPosition};

/// Header written at the top of a freshly created history file.
pub const HISTORY_HEADER: &str = "timestamp,id,x,y,z\n";

// ─── Sinks ──────────────────────────────────────────────────────────

/// Destination for published expected poses.
pub trait PoseSink: Send + std::fmt::Debug {
    fn append(&mut self, timestamp: DateTime<Utc>, marker_id: MarkerId, position: &WorldPosition);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseRecord {
    pub timestamp: DateTime<Utc>,
    pub marker_id: MarkerId,
    pub position: WorldPosition,
}

/// Queues records for a writer task started by [`PoseHistoryWriter::spawn`].
/// Appending never blocks.
#[derive(Debug, Clone)]
pub struct QueuedPoseSink {
    tx: mpsc::UnboundedSender<PoseRecord>,
}

impl PoseSink for QueuedPoseSink {
    fn append(&mut self, timestamp: DateTime<Utc>, marker_id: MarkerId, position: &WorldPosition) {
        let record = PoseRecord {
            timestamp,
            marker_id,
            position: *position,
        };
        if self.tx.send(record).is_err() {
            tracing::debug!(marker_id, "pose history writer stopped, record dropped");
        }
    }
}

// ─── Writer ─────────────────────────────────────────────────────────

pub struct PoseHistoryWriter {
    sink: Box<dyn Write + Send>,
    path: Option<PathBuf>,
    failures: u64,
}

impl std::fmt::Debug for PoseHistoryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoseHistoryWriter")
            .field("path", &self.path)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl PoseHistoryWriter {
    /// Wrap an arbitrary sink. No header is written.
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            path: None,
            failures: 0,
        }
    }

    /// Open (or create) the dated history file under `dir`.
    ///
    /// Layout: `<dir>/<Y>_<M>_<D>/<Y>_<M>_<D>_<h>_<m>_pose_history.csv`.
    /// The header is only written when the file is new.
    pub fn create_in(dir: &Path, now: DateTime<Utc>) -> io::Result<Self> {
        let path = history_file_path(dir, now);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(HISTORY_HEADER.as_bytes())?;
        }
        tracing::info!(path = %path.display(), "pose history enabled");
        Ok(Self {
            sink: Box::new(file),
            path: Some(path),
            failures: 0,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of records that could not be written.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Move the writer onto the blocking pool.
    ///
    /// The task drains records until every clone of the returned sink is
    /// dropped, then hands the writer back.
    pub fn spawn(mut self) -> (QueuedPoseSink, JoinHandle<PoseHistoryWriter>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PoseRecord>();
        let task = tokio::task::spawn_blocking(move || {
            while let Some(record) = rx.blocking_recv() {
                self.record(record.timestamp, record.marker_id, &record.position);
            }
            self
        });
        (QueuedPoseSink { tx }, task)
    }

    /// Append one record. Returns false (and logs) if the write failed.
    pub fn record(
        &mut self,
        timestamp: DateTime<Utc>,
        marker_id: MarkerId,
        position: &WorldPosition,
    ) -> bool {
        let line = format_line(timestamp, marker_id, position);
        let result = self
            .sink
            .write_all(line.as_bytes())
            .and_then(|()| self.sink.flush());
        match result {
            Ok(()) => true,
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                tracing::warn!(marker_id, failures = self.failures, "pose history write failed: {e}");
                false
            }
        }
    }
}

impl PoseSink for PoseHistoryWriter {
    fn append(&mut self, timestamp: DateTime<Utc>, marker_id: MarkerId, position: &WorldPosition) {
        self.record(timestamp, marker_id, position);
    }
}

pub fn format_line(timestamp: DateTime<Utc>, marker_id: MarkerId, position: &WorldPosition) -> String {
    format!(
        "{},{},{},{},{}\n",
        timestamp.timestamp_millis(),
        marker_id,
        position.x,
        position.y,
        position.z
    )
}

pub fn history_file_path(dir: &Path, now: DateTime<Utc>) -> PathBuf {
    let day = format!("{}_{}_{}", now.year(), now.month(), now.day());
    let file = format!("{day}_{}_{}_pose_history.csv", now.hour(), now.minute());
    dir.join(day).join(file)
}
