//! Config resolution: JSON file, then CLI overrides, then validation.

use std::path::Path;

use anyhow::{Context, bail};

use mocap_core::{
    Bounds, CameraConfig, ExtrinsicTransform, PipelineConfig, SourceHandle,
};

use crate::cli::RunOpts;

pub fn load(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

pub fn apply_overrides(config: &mut PipelineConfig, opts: &RunOpts) -> anyhow::Result<()> {
    if let Some(mode) = opts.mode {
        config.output.mode = mode;
    }
    if let Some(bounds) = &opts.bounds {
        let Ok(bounds) = <[f64; 4]>::try_from(bounds.as_slice()) else {
            bail!("--bounds takes 4 values, got {}", bounds.len());
        };
        config.output.bounds = Bounds::from(bounds);
    }
    if let Some(origin) = &opts.origin {
        let Ok(origin) = <[f64; 3]>::try_from(origin.as_slice()) else {
            bail!("--origin takes 3 values, got {}", origin.len());
        };
        config.output.origin = origin;
    }
    if let Some(round) = opts.round {
        config.output.rounding = round;
    }
    if let Some(dir) = &opts.save_dir {
        config.pose_history_dir = Some(dir.clone());
    }
    Ok(())
}

/// Load, override and validate.
pub fn resolve(opts: &RunOpts) -> anyhow::Result<PipelineConfig> {
    let mut config = load(opts.config.as_deref())?;
    apply_overrides(&mut config, opts)?;
    config.validate().context("invalid pipeline config")?;
    Ok(config)
}

/// Defaults plus one recorded camera, as a starting point for a config file.
pub fn example_config() -> PipelineConfig {
    let camera = CameraConfig::new(
        1,
        SourceHandle::Recording {
            path: "recordings/cam1.ndjson".into(),
        },
    )
    .with_extrinsic(ExtrinsicTransform::identity());
    PipelineConfig {
        camera_count: Some(1),
        cameras: vec![camera],
        ..PipelineConfig::default()
    }
}

pub fn example_config_json() -> anyhow::Result<String> {
    serde_json::to_string_pretty(&example_config()).context("failed to serialise config")
}
