use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use crate::config::ReadMode;
use crate::frame::{BYTES_PER_PIXEL, Frame, Surface};
use crate::pool::{FramePool, PoolStats};
use crate::session::{CaptureSession, FrameSource, SessionState};
use crate::{CaptureError, Result};

/// Metadata of a frame written by [`FrameReader::read_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub timestamp: Instant,
}

impl FrameInfo {
    pub fn packed_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Consumer-side view of a session's frame pool.
#[derive(Clone)]
pub struct FrameReader<S> {
    pool: Arc<FramePool<S>>,
    mode: ReadMode,
}

impl<S: Surface> FrameReader<S> {
    pub fn new(pool: Arc<FramePool<S>>, mode: ReadMode) -> Self {
        Self { pool, mode }
    }

    /// Newest frame under this reader's mode, or the reason there is none.
    pub fn latest(&self) -> Result<Arc<Frame<S>>> {
        if self.pool.is_closed() {
            return Err(CaptureError::SessionEnded);
        }

        let frame = match self.mode {
            ReadMode::Latest => self.pool.pull_latest(),
            ReadMode::LatestAndClear => self.pool.pull_latest_and_clear(),
        };

        frame.ok_or(CaptureError::NoFrame)
    }

    /// Copies the newest frame into `buf` as packed BGRA.
    ///
    /// Nothing is written unless the whole frame fits. The surface is mapped
    /// outside the pool lock, so the capture callback keeps running while
    /// this copies.
    ///
    /// In [`ReadMode::LatestAndClear`] the frame is consumed only once it has
    /// been copied, so a caller that got `BufferTooSmall` can grow its buffer
    /// and retry the same frame.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<FrameInfo> {
        if self.pool.is_closed() {
            return Err(CaptureError::SessionEnded);
        }
        let frame = self.pool.pull_latest().ok_or(CaptureError::NoFrame)?;

        let required = frame.packed_len().ok_or_else(|| {
            CaptureError::CaptureFailed(format!(
                "frame size {}x{} overflows",
                frame.width(),
                frame.height()
            ))
        })?;

        if buf.len() < required {
            return Err(CaptureError::BufferTooSmall {
                required,
                capacity: buf.len(),
                width: frame.width(),
                height: frame.height(),
            });
        }

        let row_bytes = frame.width() as usize * BYTES_PER_PIXEL;
        let copied = frame
            .surface()
            .map()
            .and_then(|mapped| mapped.copy_packed(&mut buf[..required], row_bytes, frame.height() as usize));

        if let Err(e) = copied {
            if let CaptureError::DeviceLost(reason) = &e {
                warn!("GPU device lost while reading frame: {}", reason);
                self.pool.close();
                return Err(CaptureError::SessionEnded);
            }
            return Err(e);
        }

        if self.mode == ReadMode::LatestAndClear {
            self.pool.clear_through(frame.sequence());
        }

        debug!(
            "Read frame #{} ({}x{})",
            frame.sequence(),
            frame.width(),
            frame.height()
        );

        Ok(FrameInfo {
            width: frame.width(),
            height: frame.height(),
            sequence: frame.sequence(),
            timestamp: frame.timestamp(),
        })
    }
}

/// Object-safe session handle for callers that do not care about the
/// concrete frame source.
pub trait FrameGrab: Send + Sync {
    fn read_into(&self, buf: &mut [u8]) -> Result<FrameInfo>;
    fn state(&self) -> SessionState;
    fn stats(&self) -> PoolStats;
    fn stop(&self);
}

impl<S> FrameGrab for CaptureSession<S>
where
    S: FrameSource + 'static,
{
    fn read_into(&self, buf: &mut [u8]) -> Result<FrameInfo> {
        self.reader().read_into(buf)
    }

    fn state(&self) -> SessionState {
        CaptureSession::state(self)
    }

    fn stats(&self) -> PoolStats {
        CaptureSession::stats(self)
    }

    fn stop(&self) {
        CaptureSession::stop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use crate::frame::{CpuSurface, MappedSurface};
    use crate::synthetic::SyntheticSource;
    use crate::SessionConfig;

    const RED: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

    fn reader_with(frames: Vec<Frame<CpuSurface>>, mode: ReadMode) -> FrameReader<CpuSurface> {
        let pool = Arc::new(FramePool::new(4));
        for f in frames {
            pool.push(f);
        }
        FrameReader::new(pool, mode)
    }

    #[test]
    fn test_no_frame_before_arrival() {
        let reader = reader_with(Vec::new(), ReadMode::Latest);
        let mut buf = vec![0u8; 16];
        assert!(matches!(reader.read_into(&mut buf), Err(CaptureError::NoFrame)));
    }

    #[test]
    fn test_small_buffer_is_untouched() {
        let frame = Frame::new(CpuSurface::solid(10, 10, RED, 0), 10, 10, 40);
        let reader = reader_with(vec![frame], ReadMode::Latest);

        let mut buf = vec![0xAAu8; 10 * 10 * 4 - 1];
        match reader.read_into(&mut buf) {
            Err(CaptureError::BufferTooSmall { required, capacity, width, height }) => {
                assert_eq!(required, 400);
                assert_eq!(capacity, 399);
                assert_eq!((width, height), (10, 10));
            }
            other => panic!("expected BufferTooSmall, got {:?}", other),
        }
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_padding_is_stripped() {
        let frame = Frame::new(CpuSurface::solid(5, 3, RED, 12), 5, 3, 32);
        let reader = reader_with(vec![frame], ReadMode::Latest);

        let mut buf = vec![0u8; 5 * 3 * 4 + 8];
        let info = reader.read_into(&mut buf).unwrap();

        assert_eq!((info.width, info.height), (5, 3));
        assert_eq!(info.packed_len(), 60);
        assert!(buf[..60].chunks_exact(4).all(|px| px == RED));
        assert!(buf[60..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_latest_and_clear_consumes() {
        let frames = vec![
            Frame::new(CpuSurface::solid(1, 1, [1, 0, 0, 0], 0), 1, 1, 4),
            Frame::new(CpuSurface::solid(1, 1, [2, 0, 0, 0], 0), 1, 1, 4),
        ];
        let reader = reader_with(frames, ReadMode::LatestAndClear);

        let mut buf = [0u8; 4];
        let info = reader.read_into(&mut buf).unwrap();
        assert_eq!(buf[0], 2);
        assert_eq!(info.sequence, 2);
        assert!(matches!(reader.read_into(&mut buf), Err(CaptureError::NoFrame)));
    }

    #[test]
    fn test_latest_and_clear_keeps_frame_on_small_buffer() {
        let frame = Frame::new(CpuSurface::solid(2, 2, RED, 0), 2, 2, 8);
        let reader = reader_with(vec![frame], ReadMode::LatestAndClear);

        let mut small = vec![0u8; 4];
        let required = match reader.read_into(&mut small) {
            Err(CaptureError::BufferTooSmall { required, .. }) => required,
            other => panic!("expected BufferTooSmall, got {:?}", other),
        };
        assert_eq!(required, 16);

        let mut buf = vec![0u8; required];
        let info = reader.read_into(&mut buf).unwrap();
        assert_eq!((info.width, info.height), (2, 2));
        assert!(buf.chunks_exact(4).all(|px| px == RED));
        assert!(matches!(reader.read_into(&mut buf), Err(CaptureError::NoFrame)));
    }

    struct LostSurface;

    impl Surface for LostSurface {
        fn map(&self) -> Result<MappedSurface<'_>> {
            Err(CaptureError::DeviceLost("removed".into()))
        }
    }

    #[test]
    fn test_device_lost_ends_session() {
        let pool = Arc::new(FramePool::new(2));
        pool.push(Frame::new(LostSurface, 1, 1, 4));
        let reader = FrameReader::new(pool.clone(), ReadMode::Latest);

        let mut buf = [0u8; 4];
        assert!(matches!(reader.read_into(&mut buf), Err(CaptureError::SessionEnded)));
        assert!(pool.is_closed());
        assert!(matches!(reader.read_into(&mut buf), Err(CaptureError::SessionEnded)));
    }

    #[test]
    fn test_end_to_end_solid_red() {
        let source = SyntheticSource::new(100, 100)
            .with_color(RED)
            .with_row_padding(64);
        let session = CaptureSession::new(source, SessionConfig::default()).unwrap();
        session.start().unwrap();

        let mut buf = vec![0u8; 100 * 100 * 4];
        let mut info = None;
        for _ in 0..1000 {
            match session.read_into(&mut buf) {
                Ok(i) => {
                    info = Some(i);
                    break;
                }
                Err(CaptureError::NoFrame) => thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let info = info.expect("no frame arrived");
        assert_eq!((info.width, info.height), (100, 100));
        assert!(buf.chunks_exact(4).all(|px| px == RED));

        session.stop();
        assert_eq!(session.stats().live, 0);
    }
}
