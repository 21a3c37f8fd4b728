//! Camera worker: capture -> detect -> transform loop for one camera.
//!
//! Each worker runs as its own tokio task and publishes a wholesale
//! replacement `Arc<CameraSnapshot>` through a watch channel after every
//! processed frame. Readers only ever see complete snapshots.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use mocap_core::{
    CameraCalibration, CameraConfig, CameraId, CameraSnapshot, CaptureConfig, ExtrinsicTransform,
    MarkerObservation, WorldPosition,
};

use crate::error::CameraError;
use crate::source::{Detection, FrameSource, MarkerDetector};

/// Cap on the exponential retry backoff, as a power of two frame periods.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Number of frame periods to wait after `failures` consecutive failed cycles.
pub fn backoff_ticks(failures: u32) -> u32 {
    if failures == 0 {
        return 0;
    }
    2u32.saturating_pow((failures - 1).min(MAX_BACKOFF_EXPONENT))
}

// ─── Options ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub frame_period: Duration,
    pub read_timeout: Duration,
    pub keep_old_values: bool,
}

impl From<&CaptureConfig> for WorkerOptions {
    fn from(cfg: &CaptureConfig) -> Self {
        Self {
            frame_period: cfg.frame_period(),
            read_timeout: cfg.read_timeout(),
            keep_old_values: cfg.keep_old_values,
        }
    }
}

// ─── Handle ─────────────────────────────────────────────────────────

/// Read side of a worker's snapshot slot. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SnapshotFeed {
    camera_id: CameraId,
    rx: watch::Receiver<Arc<CameraSnapshot>>,
}

impl SnapshotFeed {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// The most recently published snapshot.
    pub fn latest_snapshot(&self) -> Arc<CameraSnapshot> {
        Arc::clone(&self.rx.borrow())
    }
}

/// A running worker: its snapshot feed plus the means to stop and join it.
#[derive(Debug)]
pub struct CameraHandle {
    feed: SnapshotFeed,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CameraHandle {
    pub fn camera_id(&self) -> CameraId {
        self.feed.camera_id
    }

    pub fn feed(&self) -> SnapshotFeed {
        self.feed.clone()
    }

    pub fn latest_snapshot(&self) -> Arc<CameraSnapshot> {
        self.feed.latest_snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the capture loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(camera_id = self.feed.camera_id, "camera task join failed: {e}");
        }
    }
}

// ─── Worker ─────────────────────────────────────────────────────────

pub struct CameraWorker<S, D> {
    camera_id: CameraId,
    calibration: Arc<CameraCalibration>,
    extrinsic: Option<ExtrinsicTransform>,
    options: WorkerOptions,
    source: Arc<Mutex<S>>,
    detector: Arc<D>,
    tx: watch::Sender<Arc<CameraSnapshot>>,
    seq: u64,
    consecutive_failures: u32,
    warned_missing_extrinsic: bool,
}

impl<S, D> CameraWorker<S, D>
where
    S: FrameSource,
    D: MarkerDetector<S::Frame>,
{
    pub fn new(camera: &CameraConfig, capture: &CaptureConfig, source: S, detector: D) -> Self {
        let (tx, _) = watch::channel(Arc::new(CameraSnapshot::empty(camera.id, Utc::now())));
        Self {
            camera_id: camera.id,
            calibration: Arc::new(camera.calibration(capture.marker_length)),
            extrinsic: camera.extrinsic,
            options: WorkerOptions::from(capture),
            source: Arc::new(Mutex::new(source)),
            detector: Arc::new(detector),
            tx,
            seq: 0,
            consecutive_failures: 0,
            warned_missing_extrinsic: false,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn feed(&self) -> SnapshotFeed {
        SnapshotFeed {
            camera_id: self.camera_id,
            rx: self.tx.subscribe(),
        }
    }

    pub fn latest_snapshot(&self) -> Arc<CameraSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// Spawn the capture loop with its own cancellation token.
    pub fn start(self) -> CameraHandle {
        self.start_with_cancel(CancellationToken::new())
    }

    /// Spawn the capture loop, stopping when `cancel` fires.
    pub fn start_with_cancel(self, cancel: CancellationToken) -> CameraHandle {
        let feed = self.feed();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            self.run(loop_cancel).await;
        });
        CameraHandle { feed, cancel, task }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.options.frame_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut skip_ticks = 0u32;

        tracing::info!(camera_id = self.camera_id, "camera worker started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if skip_ticks > 0 {
                skip_ticks -= 1;
                continue;
            }

            match self.run_cycle().await {
                Ok(()) => {}
                Err(CameraError::EndOfStream) => {
                    tracing::info!(camera_id = self.camera_id, "source ended, stopping worker");
                    let empty = self.build_snapshot(Vec::new(), Utc::now(), false);
                    self.publish(empty);
                    break;
                }
                Err(e) => {
                    if self.consecutive_failures == 1 {
                        tracing::warn!(camera_id = self.camera_id, "capture failed: {e}");
                    } else {
                        tracing::debug!(
                            camera_id = self.camera_id,
                            failures = self.consecutive_failures,
                            "capture failed: {e}"
                        );
                    }
                    skip_ticks = backoff_ticks(self.consecutive_failures).saturating_sub(1);
                }
            }
        }

        tracing::info!(camera_id = self.camera_id, "camera worker stopped");
    }

    /// One capture -> detect -> transform -> publish pass.
    ///
    /// On error nothing is published and the previous snapshot stays current.
    pub async fn run_cycle(&mut self) -> Result<(), CameraError> {
        match self.capture_and_detect().await {
            Ok(detections) => {
                self.consecutive_failures = 0;
                let keep_old = self.options.keep_old_values;
                let snapshot = self.build_snapshot(detections, Utc::now(), keep_old);
                self.publish(snapshot);
                Ok(())
            }
            Err(e) => {
                if e.is_transient() {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }
                Err(e)
            }
        }
    }

    async fn capture_and_detect(&self) -> Result<Vec<Detection>, CameraError> {
        let source = Arc::clone(&self.source);
        let detector = Arc::clone(&self.detector);
        let calibration = Arc::clone(&self.calibration);

        let task = tokio::task::spawn_blocking(move || {
            let frame = {
                let mut guard = match source.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::WouldBlock) => return Err(CameraError::Busy),
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                };
                guard.read()?
            };
            detector.detect(&frame, &calibration)
        });

        match tokio::time::timeout(self.options.read_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CameraError::CaptureFailed(format!("capture task failed: {e}"))),
            Err(_) => Err(CameraError::Timeout(self.options.read_timeout)),
        }
    }

    /// Build the next snapshot from one frame's detections.
    ///
    /// With `keep_old` and no detections, the previous observations are
    /// carried forward re-stamped to `now`; otherwise the snapshot holds
    /// exactly what this frame saw.
    pub fn build_snapshot(
        &mut self,
        detections: Vec<Detection>,
        now: DateTime<Utc>,
        keep_old: bool,
    ) -> CameraSnapshot {
        self.seq += 1;

        if detections.is_empty() && keep_old {
            let previous = self.latest_snapshot();
            if !previous.is_empty() {
                let observations = previous
                    .observations
                    .iter()
                    .map(|(&id, obs)| {
                        let mut obs = obs.clone();
                        obs.timestamp = now;
                        (id, obs)
                    })
                    .collect();
                return CameraSnapshot {
                    camera_id: self.camera_id,
                    seq: self.seq,
                    captured_at: now,
                    observations,
                    retained: true,
                };
            }
        }

        let mut observations = BTreeMap::new();
        for detection in detections {
            let world_position = self.to_world(&detection.tvec);
            observations.insert(
                detection.marker_id,
                MarkerObservation {
                    marker_id: detection.marker_id,
                    camera_id: self.camera_id,
                    world_position,
                    timestamp: now,
                },
            );
        }

        CameraSnapshot {
            camera_id: self.camera_id,
            seq: self.seq,
            captured_at: now,
            observations,
            retained: false,
        }
    }

    fn to_world(&mut self, tvec: &Vector3<f64>) -> WorldPosition {
        match &self.extrinsic {
            Some(extrinsic) => extrinsic.apply(tvec),
            None => {
                if !self.warned_missing_extrinsic {
                    tracing::warn!(
                        camera_id = self.camera_id,
                        "no extrinsic transform registered, using camera coordinates"
                    );
                    self.warned_missing_extrinsic = true;
                }
                *tvec
            }
        }
    }

    fn publish(&self, snapshot: CameraSnapshot) {
        tracing::trace!(
            camera_id = self.camera_id,
            seq = snapshot.seq,
            markers = snapshot.len(),
            "snapshot published"
        );
        self.tx.send_replace(Arc::new(snapshot));
    }
}
