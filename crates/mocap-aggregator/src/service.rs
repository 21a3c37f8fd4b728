//! Timer-driven aggregator: owns the camera handles and ticks the shared
//! [`Aggregator`] at a fixed rate, independent of camera frame rates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use mocap_camera::{CameraHandle, SnapshotFeed};
use mocap_core::{CameraId, CameraSnapshot, MarkerId, WorldPosition};

use crate::aggregator::{Aggregator, TickReport};

pub struct AggregatorService {
    state: Arc<Mutex<Aggregator>>,
    cameras: Vec<CameraHandle>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AggregatorService {
    /// Take ownership of the running cameras and start ticking.
    pub fn spawn(
        aggregator: Aggregator,
        cameras: Vec<CameraHandle>,
        tick_period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(Mutex::new(aggregator));
        let feeds: Vec<SnapshotFeed> = cameras.iter().map(CameraHandle::feed).collect();
        let task = tokio::spawn(run_tick_loop(
            Arc::clone(&state),
            feeds,
            tick_period,
            cancel.clone(),
        ));
        Self {
            state,
            cameras,
            cancel,
            task,
        }
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.iter().map(CameraHandle::camera_id).collect()
    }

    /// Cameras whose capture loop is still running.
    pub fn live_cameras(&self) -> usize {
        self.cameras.iter().filter(|c| !c.is_finished()).count()
    }

    pub fn state(&self) -> Arc<Mutex<Aggregator>> {
        Arc::clone(&self.state)
    }

    /// Copy of the expected pose of every tracked marker, as of now.
    pub async fn snapshot_expected_poses(&self) -> BTreeMap<MarkerId, WorldPosition> {
        self.state.lock().await.snapshot_expected_poses(Utc::now())
    }

    /// Stop ticking, then stop and join every camera worker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("aggregator task join failed: {e}");
        }
        for camera in self.cameras {
            camera.stop().await;
        }
        tracing::info!("aggregator stopped");
    }
}

/// Read every feed once and feed the snapshots through one aggregator tick.
pub async fn tick_once(state: &Mutex<Aggregator>, feeds: &[SnapshotFeed]) -> TickReport {
    let snapshots: Vec<Arc<CameraSnapshot>> =
        feeds.iter().map(SnapshotFeed::latest_snapshot).collect();
    state
        .lock()
        .await
        .tick(snapshots.iter().map(AsRef::as_ref), Utc::now())
}

async fn run_tick_loop(
    state: Arc<Mutex<Aggregator>>,
    feeds: Vec<SnapshotFeed>,
    tick_period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(tick_period);
    // Falling behind just means some camera frames are never seen.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(cameras = feeds.len(), ?tick_period, "aggregator started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = tick_once(&state, &feeds).await;
        if !report.is_idle() {
            tracing::debug!(
                ingested = report.snapshots_ingested,
                pushed = report.observations_pushed,
                created = report.queues_created,
                expired = report.queues_expired,
                "aggregator tick"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use mocap_camera::{CameraWorker, RecordedDetector, ReplaySource};
    use mocap_core::{CameraConfig, CaptureConfig, ExtrinsicTransform, QueueConfig, SourceHandle};
    use nalgebra::{Matrix4, Vector3};

    use super::*;

    fn recording(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for line in lines {
            writeln!(file, "{line}").expect("write");
        }
        file.flush().expect("flush");
        file
    }

    fn capture() -> CaptureConfig {
        CaptureConfig {
            frame_rate_hz: 100.0,
            ..CaptureConfig::default()
        }
    }

    fn start_camera(id: CameraId, path: PathBuf, extrinsic: Option<ExtrinsicTransform>) -> CameraHandle {
        let mut camera = CameraConfig::new(id, SourceHandle::Recording { path: path.clone() });
        camera.extrinsic = extrinsic;
        let source = ReplaySource::open(&path).expect("open").looping(true);
        CameraWorker::new(&camera, &capture(), source, RecordedDetector).start()
    }

    #[tokio::test]
    async fn fuses_markers_from_two_cameras() {
        let cam1 = recording(&[r#"{"detections": [{"marker_id": 5, "tvec": [10, 0, 0]}]}"#]);
        let cam2 = recording(&[r#"{"detections": [{"marker_id": 6, "tvec": [0, 0, 5]}]}"#]);

        let mut shift = Matrix4::identity();
        shift[(0, 3)] = 100.0;
        let cameras = vec![
            start_camera(1, cam1.path().to_path_buf(), Some(ExtrinsicTransform::identity())),
            start_camera(2, cam2.path().to_path_buf(), Some(ExtrinsicTransform::from_matrix(shift))),
        ];

        let service = AggregatorService::spawn(
            Aggregator::new(QueueConfig::default()),
            cameras,
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        assert_eq!(service.camera_ids(), vec![1, 2]);

        let mut poses = BTreeMap::new();
        for _ in 0..200 {
            poses = service.snapshot_expected_poses().await;
            if poses.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(poses.len(), 2, "both markers tracked: {poses:?}");
        // Every sample is identical, so any weighting stays on the same line.
        assert!(poses[&5].y.abs() < 1e-9);
        assert!(poses[&6].x > 0.0);
        assert_eq!(poses[&6].y, 0.0);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_all_workers() {
        let cam = recording(&[r#"{"detections": []}"#]);
        let cancel = CancellationToken::new();
        let service = AggregatorService::spawn(
            Aggregator::new(QueueConfig::default()),
            vec![start_camera(1, cam.path().to_path_buf(), None)],
            Duration::from_millis(5),
            cancel.clone(),
        );
        assert_eq!(service.live_cameras(), 1);

        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .expect("shutdown completes");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn tick_once_skips_unchanged_snapshots() {
        let cam = recording(&[r#"{"detections": [{"marker_id": 3, "tvec": [1, 2, 3]}]}"#]);
        let path = cam.path().to_path_buf();
        let camera = CameraConfig::new(1, SourceHandle::Recording { path: path.clone() })
            .with_extrinsic(ExtrinsicTransform::identity());
        let mut worker = CameraWorker::new(
            &camera,
            &capture(),
            ReplaySource::open(&path).expect("open"),
            RecordedDetector,
        );
        worker.run_cycle().await.expect("cycle");

        let state = Mutex::new(Aggregator::new(QueueConfig::default()));
        let feeds = vec![worker.feed()];

        let first = tick_once(&state, &feeds).await;
        assert_eq!(first.observations_pushed, 1);
        let second = tick_once(&state, &feeds).await;
        assert_eq!(second.snapshots_ingested, 0);

        let poses = state.lock().await.snapshot_expected_poses(Utc::now());
        assert_eq!(poses[&3], Vector3::new(1.0, 2.0, 3.0));
    }
}
