//! Recorded-detection replay: a `FrameSource` backed by an NDJSON log.
//!
//! Each line is one frame: `{"detections": [{"marker_id": 5, "rvec": [..], "tvec": [..]}]}`.
//! Blank lines are skipped. Detection already happened when the log was
//! written, so [`RecordedDetector`] just hands the stored poses back.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mocap_core::{CameraCalibration, SourceHandle};

use crate::error::CameraError;
use crate::source::{Detection, FrameSource, MarkerDetector};

/// One recorded frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

#[derive(Debug)]
pub struct ReplaySource {
    path: PathBuf,
    reader: BufReader<File>,
    line_num: usize,
    looping: bool,
}

impl ReplaySource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            line_num: 0,
            looping: false,
        })
    }

    /// Rewind to the first line instead of ending the stream.
    #[must_use]
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewind(&mut self) -> Result<(), CameraError> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.line_num = 0;
        Ok(())
    }
}

impl FrameSource for ReplaySource {
    type Frame = RecordedFrame;

    fn read(&mut self) -> Result<RecordedFrame, CameraError> {
        let mut rewound = false;
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                // An empty or all-blank file would loop forever.
                if self.looping && !rewound && self.line_num > 0 {
                    self.rewind()?;
                    rewound = true;
                    continue;
                }
                return Err(CameraError::EndOfStream);
            }
            self.line_num += 1;

            let line = buf.trim();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line).map_err(|e| CameraError::ParseError {
                line_num: self.line_num,
                detail: e.to_string(),
            });
        }
    }
}

/// Passes the detections stored in a [`RecordedFrame`] through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordedDetector;

impl MarkerDetector<RecordedFrame> for RecordedDetector {
    fn detect(
        &self,
        frame: &RecordedFrame,
        _calibration: &CameraCalibration,
    ) -> Result<Vec<Detection>, CameraError> {
        Ok(frame.detections.clone())
    }
}

/// Open the source named by a camera's config.
///
/// Only recordings can be opened here; live devices need an external
/// capture backend and are reported as unsupported.
pub fn open_source(handle: &SourceHandle, looping: bool) -> Result<ReplaySource, CameraError> {
    match handle {
        SourceHandle::Recording { path } => Ok(ReplaySource::open(path)?.looping(looping)),
        SourceHandle::Device { index } => Err(CameraError::UnsupportedDevice(*index)),
    }
}
