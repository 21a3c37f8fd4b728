//! Pipeline wiring: cameras -> aggregator service -> projector -> stdout.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use mocap_aggregator::{Aggregator, AggregatorService, PoseHistoryWriter};
use mocap_camera::{CameraHandle, CameraWorker, RecordedDetector, open_source};
use mocap_core::{ClientPoint, MarkerId, PipelineConfig};
use mocap_projector::OutputProjector;

/// Totals reported when the pipeline stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub frames_written: u64,
    pub markers_published: usize,
}

/// Run until ctrl-c/SIGTERM or until every camera source has ended.
pub async fn run(config: PipelineConfig, looping: bool) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signals = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    let mut stdout = tokio::io::stdout();
    let stats = run_with_output(&config, looping, &mut stdout, cancel).await;
    signals.abort();

    let stats = stats?;
    tracing::info!(
        frames = stats.frames_written,
        markers = stats.markers_published,
        "pipeline stopped"
    );
    Ok(())
}

/// Start every configured camera and the aggregator, then publish client
/// points to `out` until `cancel` fires or all sources end.
pub async fn run_with_output<W>(
    config: &PipelineConfig,
    looping: bool,
    out: &mut W,
    cancel: CancellationToken,
) -> anyhow::Result<PublishStats>
where
    W: AsyncWrite + Unpin,
{
    let cameras = start_cameras(config, looping, &cancel).await?;

    let mut aggregator = Aggregator::new(config.queue.clone());
    let mut history_task = None;
    if let Some(dir) = &config.pose_history_dir {
        match PoseHistoryWriter::create_in(dir, Utc::now()) {
            Ok(writer) => {
                let (sink, task) = writer.spawn();
                aggregator = aggregator.with_history(sink);
                history_task = Some(task);
            }
            Err(e) => tracing::warn!(dir = %dir.display(), "pose history disabled: {e}"),
        }
    }

    let service =
        AggregatorService::spawn(aggregator, cameras, config.tick_period(), cancel.child_token());
    let mut projector = OutputProjector::new(&config.output);

    let published = publish_loop(&service, &mut projector, out, config.output.publish_period(), &cancel).await;
    // Dropping the aggregator closes the history queue.
    service.shutdown().await;
    if let Some(task) = history_task {
        finish_history(task).await;
    }

    let frames_written = published?;
    Ok(PublishStats {
        frames_written,
        markers_published: projector.published_points().len(),
    })
}

async fn finish_history(task: JoinHandle<PoseHistoryWriter>) {
    match task.await {
        Ok(writer) if writer.failures() > 0 => {
            tracing::warn!(failures = writer.failures(), "pose history incomplete");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("pose history writer failed: {e}"),
    }
}

/// Open every configured source and start a worker per camera.
///
/// Sources that cannot be opened are skipped with a warning; having fewer
/// live cameras than configured is fatal.
async fn start_cameras(
    config: &PipelineConfig,
    looping: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<CameraHandle>> {
    let mut handles = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        match open_source(&camera.source, looping) {
            Ok(source) => {
                let worker = CameraWorker::new(camera, &config.capture, source, RecordedDetector);
                handles.push(worker.start_with_cancel(cancel.child_token()));
            }
            Err(e) => tracing::warn!(camera_id = camera.id, "camera source unavailable: {e}"),
        }
    }

    if let Err(e) = config.ensure_camera_count(handles.len()) {
        for handle in handles {
            handle.stop().await;
        }
        return Err(e).context("camera discovery failed");
    }
    tracing::info!(cameras = handles.len(), "cameras started");
    Ok(handles)
}

async fn publish_loop<W>(
    service: &AggregatorService,
    projector: &mut OutputProjector,
    out: &mut W,
    period: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let origin = (Instant::now(), Utc::now());
    let mut frames = 0u64;

    loop {
        let scheduled = tokio::select! {
            () = cancel.cancelled() => break,
            at = ticker.tick() => at,
        };

        // Throttle on the schedule, not on wake-up time, so jitter cannot
        // push a tick just short of a full period.
        let now = scheduled_wall_time(origin, scheduled);
        if projector.is_due(now) {
            let poses = service.snapshot_expected_poses().await;
            if let Some(points) = projector.maybe_publish(&poses, now) {
                write_frame(out, &points).await?;
                frames += 1;
            }
        }

        if service.live_cameras() == 0 {
            tracing::info!("all camera sources ended");
            break;
        }
    }
    Ok(frames)
}

/// Wall-clock time of a scheduled tick, measured from `origin`.
fn scheduled_wall_time(origin: (Instant, DateTime<Utc>), at: Instant) -> DateTime<Utc> {
    let (origin_instant, origin_wall) = origin;
    let elapsed = TimeDelta::from_std(at.saturating_duration_since(origin_instant))
        .unwrap_or(TimeDelta::zero());
    origin_wall + elapsed
}

/// One NDJSON line: `{"<marker_id>": {"x": .., "y": ..}, ..}`.
pub async fn write_frame<W>(out: &mut W, points: &BTreeMap<MarkerId, ClientPoint>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(points).context("failed to encode client points")?;
    line.push(b'\n');
    out.write_all(&line).await.context("failed to write client points")?;
    out.flush().await.context("failed to flush client points")?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use mocap_core::{
        CameraConfig, CaptureConfig, EstimatorMode, ExtrinsicTransform, OutputConfig, QueueConfig,
        SourceHandle, WorldPosition,
    };

    use super::*;

    fn recording(frames: usize, line: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for _ in 0..frames {
            writeln!(file, "{line}").expect("write");
        }
        file.flush().expect("flush");
        file
    }

    fn camera(id: u32, path: &Path) -> CameraConfig {
        CameraConfig::new(
            id,
            SourceHandle::Recording {
                path: path.to_path_buf(),
            },
        )
        .with_extrinsic(ExtrinsicTransform::identity())
    }

    fn fast_config(cameras: Vec<CameraConfig>) -> PipelineConfig {
        PipelineConfig {
            camera_count: Some(cameras.len()),
            cameras,
            capture: CaptureConfig {
                frame_rate_hz: 100.0,
                ..CaptureConfig::default()
            },
            queue: QueueConfig {
                estimator: EstimatorMode::Mean,
                ..QueueConfig::default()
            },
            aggregator_rate_hz: 200.0,
            output: OutputConfig {
                rate_hz: 100.0,
                ..OutputConfig::default()
            },
            pose_history_dir: None,
        }
    }

    #[tokio::test]
    async fn replays_to_ndjson_and_stops_at_end_of_recordings() {
        let cam1 = recording(40, r#"{"detections": [{"marker_id": 5, "tvec": [10.2, 19.8, 0]}]}"#);
        let cam2 = recording(40, r#"{"detections": [{"marker_id": 6, "tvec": [-30, 40, 7]}]}"#);
        let config = fast_config(vec![camera(1, cam1.path()), camera(2, cam2.path())]);

        let mut out = Vec::new();
        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            run_with_output(&config, false, &mut out, CancellationToken::new()),
        )
        .await
        .expect("pipeline ends with its recordings")
        .expect("pipeline ok");

        assert!(stats.frames_written > 0);
        assert_eq!(stats.markers_published, 2);

        let text = String::from_utf8(out).expect("utf8");
        let last = text.lines().last().expect("at least one frame");
        let points: BTreeMap<String, ClientPoint> = serde_json::from_str(last).expect("json");
        assert_eq!(points["5"], ClientPoint { x: 10.0, y: 20.0 });
        assert_eq!(points["6"], ClientPoint { x: -30.0, y: 40.0 });
    }

    #[tokio::test]
    async fn cancel_stops_looping_replay() {
        let cam = recording(1, r#"{"detections": [{"marker_id": 1, "tvec": [0, 0, 0]}]}"#);
        let config = fast_config(vec![camera(1, cam.path())]);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let mut out = Vec::new();
        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            run_with_output(&config, true, &mut out, cancel),
        )
        .await
        .expect("cancel honoured")
        .expect("pipeline ok");
        assert!(stats.frames_written > 0);
    }

    #[tokio::test]
    async fn too_few_live_cameras_is_fatal() {
        let cam = recording(1, r#"{"detections": []}"#);
        let mut config = fast_config(vec![
            camera(1, cam.path()),
            camera(2, Path::new("/nonexistent/mocap/cam2.ndjson")),
        ]);
        config.camera_count = Some(2);

        let mut out = Vec::new();
        let err = run_with_output(&config, false, &mut out, CancellationToken::new())
            .await
            .expect_err("missing camera");
        assert!(format!("{err:#}").contains("expected 2 live camera sources, found 1"));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn pose_history_written_when_enabled() {
        let cam = recording(20, r#"{"detections": [{"marker_id": 2, "tvec": [1, 2, 3]}]}"#);
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = fast_config(vec![camera(1, cam.path())]);
        config.pose_history_dir = Some(dir.path().to_path_buf());

        let mut out = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(10),
            run_with_output(&config, false, &mut out, CancellationToken::new()),
        )
        .await
        .expect("finishes")
        .expect("pipeline ok");

        let day_dir = std::fs::read_dir(dir.path())
            .expect("read dir")
            .next()
            .expect("dated folder")
            .expect("entry")
            .path();
        let csv = std::fs::read_dir(&day_dir)
            .expect("read day dir")
            .next()
            .expect("history file")
            .expect("entry")
            .path();
        let text = std::fs::read_to_string(csv).expect("read csv");
        assert!(text.starts_with("timestamp,id,x,y,z\n"));
        assert!(text.lines().skip(1).all(|l| l.split(',').nth(1) == Some("2")));
    }

    #[test]
    fn every_scheduled_tick_is_due() {
        let config = OutputConfig {
            rate_hz: 30.0,
            ..OutputConfig::default()
        };
        let period = config.publish_period();
        let mut projector = OutputProjector::new(&config);
        let origin_instant = Instant::now();
        let origin = (origin_instant, Utc::now());
        let poses = BTreeMap::from([(1, WorldPosition::new(1.0, 2.0, 3.0))]);

        let published = (0..90u32)
            .filter(|&k| {
                let now = scheduled_wall_time(origin, origin_instant + period * k);
                projector.maybe_publish(&poses, now).is_some()
            })
            .count();
        assert_eq!(published, 90);
    }

    #[test]
    fn tick_before_origin_maps_to_origin() {
        let origin_instant = Instant::now() + Duration::from_secs(1);
        let origin_wall = Utc::now();
        let now = scheduled_wall_time((origin_instant, origin_wall), Instant::now());
        assert_eq!(now, origin_wall);
    }

    #[tokio::test]
    async fn write_frame_emits_one_line() {
        let mut out = Vec::new();
        let points = BTreeMap::from([(3, ClientPoint { x: 1.0, y: -2.0 })]);
        write_frame(&mut out, &points).await.expect("write");
        assert_eq!(out, b"{\"3\":{\"x\":1.0,\"y\":-2.0}}\n");
    }
}
