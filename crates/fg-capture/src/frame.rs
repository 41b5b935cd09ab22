use std::fmt;
use std::time::Instant;
use crate::pool::LiveToken;
use crate::{CaptureError, Result};

/// Frames are always delivered as packed BGRA.
pub const BYTES_PER_PIXEL: usize = 4;

/// A GPU (or GPU-like) surface holding one captured image.
///
/// Implementations must be safe to map from any thread; the OS callback
/// produces surfaces on its own thread and readers map them on theirs.
pub trait Surface: Send + Sync {
    /// Maps the surface for CPU read. The mapping is released when the
    /// returned guard is dropped.
    fn map(&self) -> Result<MappedSurface<'_>>;
}

/// CPU view of a mapped surface. Rows are `row_pitch` bytes apart, which may
/// be more than the visible row width.
pub struct MappedSurface<'a> {
    data: &'a [u8],
    row_pitch: usize,
    unmap: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> MappedSurface<'a> {
    pub fn new(data: &'a [u8], row_pitch: usize) -> Self {
        Self {
            data,
            row_pitch,
            unmap: None,
        }
    }

    /// Attaches the action that releases the mapping.
    pub fn with_unmap(mut self, unmap: impl FnOnce() + 'a) -> Self {
        self.unmap = Some(Box::new(unmap));
        self
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data
    }

    #[inline]
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    /// Copies `height` rows of `row_bytes` each into `dst`, dropping the
    /// per-row padding.
    pub fn copy_packed(&self, dst: &mut [u8], row_bytes: usize, height: usize) -> Result<()> {
        if height == 0 || row_bytes == 0 {
            return Ok(());
        }

        if self.row_pitch < row_bytes {
            return Err(CaptureError::CaptureFailed(format!(
                "row pitch {} is smaller than row width {}",
                self.row_pitch, row_bytes
            )));
        }

        let needed = (height - 1) * self.row_pitch + row_bytes;
        if self.data.len() < needed {
            return Err(CaptureError::CaptureFailed(format!(
                "mapped surface holds {} bytes, {} needed",
                self.data.len(),
                needed
            )));
        }

        if dst.len() < row_bytes * height {
            return Err(CaptureError::CaptureFailed(format!(
                "destination holds {} bytes, {} needed",
                dst.len(),
                row_bytes * height
            )));
        }

        if self.row_pitch == row_bytes {
            let total = row_bytes * height;
            dst[..total].copy_from_slice(&self.data[..total]);
            return Ok(());
        }

        for (row, out) in dst.chunks_exact_mut(row_bytes).take(height).enumerate() {
            let start = row * self.row_pitch;
            out.copy_from_slice(&self.data[start..start + row_bytes]);
        }

        Ok(())
    }
}

impl Drop for MappedSurface<'_> {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap();
        }
    }
}

/// Pixel data already resident in system memory.
#[derive(Debug, Clone)]
pub struct CpuSurface {
    data: Vec<u8>,
    row_pitch: usize,
}

impl CpuSurface {
    pub fn new(data: Vec<u8>, row_pitch: usize) -> Self {
        Self { data, row_pitch }
    }

    /// A `width`x`height` surface filled with one BGRA pixel value, with
    /// `padding` extra bytes at the end of each row.
    pub fn solid(width: u32, height: u32, bgra: [u8; 4], padding: usize) -> Self {
        let row_bytes = width as usize * BYTES_PER_PIXEL;
        let row_pitch = row_bytes + padding;
        let mut data = vec![0u8; row_pitch * height as usize];

        for row in data.chunks_exact_mut(row_pitch) {
            for px in row[..row_bytes].chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&bgra);
            }
        }

        Self { data, row_pitch }
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }
}

impl Surface for CpuSurface {
    fn map(&self) -> Result<MappedSurface<'_>> {
        Ok(MappedSurface::new(&self.data, self.row_pitch))
    }
}

/// One captured image. Immutable once created; valid until the last
/// reference is dropped.
pub struct Frame<S> {
    surface: S,
    width: u32,
    height: u32,
    stride: u32,
    timestamp: Instant,
    pub(crate) sequence: u64,
    // Declared after `surface` so the surface is released first.
    pub(crate) live: Option<LiveToken>,
}

impl<S: Surface> Frame<S> {
    pub fn new(surface: S, width: u32, height: u32, stride: u32) -> Self {
        Self {
            surface,
            width,
            height,
            stride,
            timestamp: Instant::now(),
            sequence: 0,
            live: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[inline]
    pub fn surface(&self) -> &S {
        &self.surface
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row pitch known when the frame was produced. The pitch reported by
    /// [`Surface::map`] takes precedence when copying.
    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Position of this frame in push order, starting at 1.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes needed to hold this frame as packed BGRA, or `None` on overflow.
    pub fn packed_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(BYTES_PER_PIXEL)
    }
}

impl<S> fmt::Debug for Frame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_copy_strips_padding() {
        let surface = CpuSurface::solid(3, 2, [1, 2, 3, 4], 8);
        assert_eq!(surface.row_pitch(), 20);

        let mapped = surface.map().unwrap();
        let mut out = vec![0u8; 3 * 2 * BYTES_PER_PIXEL];
        mapped.copy_packed(&mut out, 12, 2).unwrap();

        assert!(out.chunks_exact(4).all(|px| px == [1, 2, 3, 4]));
    }

    #[test]
    fn test_copy_rejects_short_mapping() {
        let surface = CpuSurface::new(vec![0u8; 10], 4);
        let mapped = surface.map().unwrap();
        let mut out = vec![0u8; 16];
        assert!(mapped.copy_packed(&mut out, 4, 4).is_err());
    }

    #[test]
    fn test_unmap_runs_on_drop() {
        let data = [0u8; 4];
        let unmapped = Cell::new(false);
        {
            let _mapped = MappedSurface::new(&data, 4).with_unmap(|| unmapped.set(true));
            assert!(!unmapped.get());
        }
        assert!(unmapped.get());
    }

    #[test]
    fn test_packed_len() {
        let frame = Frame::new(CpuSurface::solid(100, 100, [0; 4], 0), 100, 100, 400);
        assert_eq!(frame.packed_len(), Some(40000));
    }
}
