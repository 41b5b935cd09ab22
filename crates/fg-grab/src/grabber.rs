use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use fg_capture::{CaptureError, FrameGrab, FrameInfo};

use crate::config::OutputConfig;
use crate::metrics::GrabMetrics;

/// Why the poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Done,
    Timeout,
    SessionEnded,
}

pub struct Grabber {
    grab: Box<dyn FrameGrab>,
    output: OutputConfig,
    metrics: GrabMetrics,
    buffer: Vec<u8>,
    last_sequence: Option<u64>,
}

impl Grabber {
    pub fn new(grab: Box<dyn FrameGrab>, output: OutputConfig) -> Self {
        Self {
            grab,
            output,
            metrics: GrabMetrics::new(),
            buffer: Vec::new(),
            last_sequence: None,
        }
    }

    pub fn metrics(&self) -> &GrabMetrics {
        &self.metrics
    }

    /// Polls until `frames` distinct frames are on disk, the timeout passes
    /// or the session ends.
    pub fn run(&mut self) -> Result<StopReason> {
        fs::create_dir_all(&self.output.dir)
            .with_context(|| format!("Failed to create {}", self.output.dir.display()))?;

        let poll_interval = Duration::from_millis(self.output.poll_interval_ms);
        let deadline = Instant::now() + Duration::from_millis(self.output.timeout_ms);

        let reason = loop {
            if self.metrics.frames_written >= self.output.frames as u64 {
                break StopReason::Done;
            }
            if Instant::now() >= deadline {
                break StopReason::Timeout;
            }

            match self.grab.read_into(&mut self.buffer) {
                Ok(info) => {
                    if self.last_sequence == Some(info.sequence) {
                        self.metrics.empty_polls += 1;
                        thread::sleep(poll_interval);
                        continue;
                    }
                    self.last_sequence = Some(info.sequence);
                    self.write_frame(&info)?;
                }
                Err(CaptureError::BufferTooSmall { required, width, height, .. }) => {
                    debug!("Growing frame buffer to {} bytes ({}x{})", required, width, height);
                    self.buffer.resize(required, 0);
                    self.metrics.buffer_resizes += 1;
                }
                Err(CaptureError::NoFrame) => {
                    self.metrics.empty_polls += 1;
                    thread::sleep(poll_interval);
                }
                Err(CaptureError::SessionEnded) => break StopReason::SessionEnded,
                Err(e) => return Err(e).context("Frame read failed"),
            }
        };

        match reason {
            StopReason::Done => info!(
                "Wrote {} frames ({:.1} fps)",
                self.metrics.frames_written,
                self.metrics.average_fps()
            ),
            StopReason::Timeout => warn!(
                "Timed out after {} of {} frames",
                self.metrics.frames_written, self.output.frames
            ),
            StopReason::SessionEnded => warn!(
                "Capture ended after {} of {} frames",
                self.metrics.frames_written, self.output.frames
            ),
        }

        self.grab.stop();
        Ok(reason)
    }

    fn write_frame(&mut self, info: &FrameInfo) -> Result<()> {
        let path = self.frame_path(info);
        let len = info.packed_len();

        fs::write(&path, &self.buffer[..len])
            .with_context(|| format!("Failed to write {}", path.display()))?;

        self.metrics.frames_written += 1;
        self.metrics.bytes_written += len as u64;
        debug!("Frame #{} -> {}", info.sequence, path.display());
        Ok(())
    }

    fn frame_path(&self, info: &FrameInfo) -> PathBuf {
        self.output.dir.join(format!(
            "frame-{:04}-{}x{}.bgra",
            self.metrics.frames_written, info.width, info.height
        ))
    }
}
