//! In-memory frame source that needs no GPU or window system.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};
use crate::frame::{BYTES_PER_PIXEL, CpuSurface, Frame};
use crate::session::{FrameSink, FrameSource};
use crate::target::{CaptureTarget, TargetKind};
use crate::{CaptureError, Result};

/// Produces solid-colour frames from a background thread, standing in for
/// the OS capture callback.
pub struct SyntheticSource {
    target: CaptureTarget,
    color: [u8; 4],
    row_padding: usize,
    interval: Duration,
    end_after: Option<u64>,
    capturable: Arc<AtomicBool>,
    should_stop: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            target: CaptureTarget::new(TargetKind::Window, 0, width, height),
            color: [0x00, 0x00, 0x00, 0xFF],
            row_padding: 0,
            interval: Duration::from_millis(1),
            end_after: None,
            capturable: Arc::new(AtomicBool::new(true)),
            should_stop: Arc::new(AtomicBool::new(false)),
            producer: None,
        }
    }

    /// Pixel value in BGRA order.
    pub fn with_color(mut self, bgra: [u8; 4]) -> Self {
        self.color = bgra;
        self
    }

    /// Extra bytes appended to every row, as a GPU would for alignment.
    pub fn with_row_padding(mut self, padding: usize) -> Self {
        self.row_padding = padding;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Terminates the stream after `frames` frames, as if the target closed.
    pub fn end_after(mut self, frames: u64) -> Self {
        self.end_after = Some(frames);
        self
    }

    /// Switch that makes [`FrameSource::validate`] fail, simulating a target
    /// that disappeared before start.
    pub fn capturable_switch(&self) -> Arc<AtomicBool> {
        self.capturable.clone()
    }
}

impl FrameSource for SyntheticSource {
    type Surface = CpuSurface;

    fn target(&self) -> &CaptureTarget {
        &self.target
    }

    fn validate(&self) -> Result<()> {
        if self.capturable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CaptureError::InvalidTarget("synthetic target is gone".into()))
        }
    }

    fn start(&mut self, sink: FrameSink<CpuSurface>) -> Result<()> {
        let (width, height) = self.target.size();
        let color = self.color;
        let padding = self.row_padding;
        let interval = self.interval;
        let end_after = self.end_after;
        let should_stop = self.should_stop.clone();
        let stride = (width as usize * BYTES_PER_PIXEL + padding) as u32;

        info!("Starting synthetic capture {}x{}", width, height);

        let producer = thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || {
                let mut produced = 0u64;
                while !should_stop.load(Ordering::Acquire) {
                    if end_after.is_some_and(|limit| produced >= limit) {
                        sink.end("synthetic stream reached its frame limit");
                        break;
                    }

                    let surface = CpuSurface::solid(width, height, color, padding);
                    if !sink.push(Frame::new(surface, width, height, stride)) {
                        break;
                    }
                    produced += 1;
                    thread::sleep(interval);
                }
                debug!("Synthetic producer exiting after {} frame(s)", produced);
            })
            .map_err(|e| CaptureError::SessionStart(format!("spawn producer: {}", e)))?;

        self.producer = Some(producer);
        Ok(())
    }

    fn stop(&mut self) {
        self.should_stop.store(true, Ordering::Release);
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
    }

    fn release(&mut self) {
        debug!("Synthetic source released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CaptureSession, SessionState};
    use crate::SessionConfig;

    #[test]
    fn test_vanished_target_fails_start() {
        let source = SyntheticSource::new(4, 4);
        source.capturable_switch().store(false, Ordering::Release);

        let session = CaptureSession::new(source, SessionConfig::default()).unwrap();
        assert!(matches!(session.start(), Err(CaptureError::SessionStart(_))));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_pool_stays_bounded_while_producing() {
        let config = SessionConfig {
            pool_capacity: 3,
            ..Default::default()
        };
        let session = CaptureSession::new(SyntheticSource::new(2, 2), config).unwrap();
        session.start().unwrap();

        for _ in 0..50 {
            assert!(session.pool().len() <= 3);
            thread::sleep(Duration::from_millis(1));
        }

        session.stop();
        let stats = session.stats();
        assert!(stats.pushed > 0);
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.live, 0);
    }
}
