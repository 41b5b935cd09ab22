use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Window,
    Monitor,
}

/// Last content size reported by the OS, packed as `width << 32 | height`.
#[derive(Debug, Default)]
struct SizeHint(AtomicU64);

impl SizeHint {
    fn new(width: u32, height: u32) -> Self {
        Self(AtomicU64::new(pack(width, height)))
    }

    fn get(&self) -> (u32, u32) {
        let packed = self.0.load(Ordering::Acquire);
        ((packed >> 32) as u32, packed as u32)
    }

    fn set(&self, width: u32, height: u32) -> bool {
        self.0.swap(pack(width, height), Ordering::AcqRel) != pack(width, height)
    }
}

#[inline]
fn pack(width: u32, height: u32) -> u64 {
    (u64::from(width) << 32) | u64::from(height)
}

/// What a session captures. The identity is fixed; the size is an advisory
/// snapshot that the capture callback refreshes on resize.
#[derive(Clone)]
pub struct CaptureTarget {
    kind: TargetKind,
    handle: usize,
    size: Arc<SizeHint>,
}

impl CaptureTarget {
    pub fn new(kind: TargetKind, handle: usize, width: u32, height: u32) -> Self {
        Self {
            kind,
            handle,
            size: Arc::new(SizeHint::new(width, height)),
        }
    }

    #[inline]
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Opaque OS handle (`HWND` or `HMONITOR` on Windows).
    #[inline]
    pub fn handle(&self) -> usize {
        self.handle
    }

    /// Size snapshot. Use the platform's live query when an exact value is
    /// needed.
    pub fn size(&self) -> (u32, u32) {
        self.size.get()
    }

    /// Records a size change. Returns `true` if the size differs from the
    /// previous snapshot. Clones share the snapshot.
    pub fn update_size(&self, width: u32, height: u32) -> bool {
        self.size.set(width, height)
    }
}

impl fmt::Debug for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("CaptureTarget")
            .field("kind", &self.kind)
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("width", &width)
            .field("height", &height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_updates_are_shared() {
        let target = CaptureTarget::new(TargetKind::Window, 0x1234, 640, 480);
        let clone = target.clone();

        assert!(!target.update_size(640, 480));
        assert!(target.update_size(800, 600));
        assert_eq!(clone.size(), (800, 600));
        assert_eq!(clone.handle(), 0x1234);
    }

    #[test]
    fn test_size_packing_round_trips_extremes() {
        let target = CaptureTarget::new(TargetKind::Monitor, 1, u32::MAX, 0);
        assert_eq!(target.size(), (u32::MAX, 0));
    }
}
