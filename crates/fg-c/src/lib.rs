use std::collections::BTreeMap;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};

use fg_capture::{CaptureError, FrameGrab, SessionConfig};

// Initialize logging once
static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        // A host process may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
    });
}

// ============================================
// C-Compatible Types
// ============================================

/// Opaque handle to a running capture session
pub struct CaptureHandle {
    grab: Box<dyn FrameGrab>,
}

/// Status codes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Success = 0,
    NoFrame = 1,
    BufferTooSmall = 2,
    SessionEnded = 3,
    InvalidHandle = 4,
    NullPointer = 5,
    CaptureFailed = 6,
    Panic = 7,
}

impl From<&CaptureError> for CaptureStatus {
    fn from(e: &CaptureError) -> Self {
        match e {
            CaptureError::NoFrame => CaptureStatus::NoFrame,
            CaptureError::BufferTooSmall { .. } => CaptureStatus::BufferTooSmall,
            CaptureError::SessionEnded | CaptureError::DeviceLost(_) => CaptureStatus::SessionEnded,
            _ => CaptureStatus::CaptureFailed,
        }
    }
}

/// Frame description filled by get_frame_ex()
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureFrameDesc {
    pub width: c_uint,
    pub height: c_uint,
    /// Bytes needed for the packed frame
    pub required_bytes: usize,
    pub sequence: u64,
}

/// Pool statistics
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub frames_pushed: u64,
    pub frames_evicted: u64,
    pub frames_buffered: u64,
    pub frames_live: u64,
    pub running: c_int,
}

// ============================================
// Handle Registry
// ============================================

// Handles given to C are registry ids, never reused, so unknown and
// already-released handles are rejected instead of dereferenced.
static HANDLES: Mutex<BTreeMap<usize, Arc<CaptureHandle>>> = Mutex::new(BTreeMap::new());
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

fn handles() -> MutexGuard<'static, BTreeMap<usize, Arc<CaptureHandle>>> {
    HANDLES.lock().unwrap_or_else(|e| e.into_inner())
}

fn register(grab: Box<dyn FrameGrab>) -> *mut CaptureHandle {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    handles().insert(id, Arc::new(CaptureHandle { grab }));
    ptr::without_provenance_mut(id)
}

fn lookup(handle: *const CaptureHandle) -> Option<Arc<CaptureHandle>> {
    if handle.is_null() {
        return None;
    }
    handles().get(&(handle as usize)).cloned()
}

// Dimensions beyond c_int saturate rather than wrap negative.
fn to_c_int(value: c_uint) -> c_int {
    c_int::try_from(value).unwrap_or(c_int::MAX)
}

fn guarded<T>(on_panic: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!("Panic caught at the C boundary");
            on_panic
        }
    }
}

fn open(name: &str, open: impl FnOnce() -> fg_capture::Result<Box<dyn FrameGrab>>) -> *mut CaptureHandle {
    init_logging();

    guarded(ptr::null_mut(), || match open() {
        Ok(grab) => {
            let handle = register(grab);
            tracing::info!("Capture opened for {} ({:p})", name, handle);
            handle
        }
        Err(e) => {
            tracing::error!("Failed to open capture for {}: {}", name, e);
            ptr::null_mut()
        }
    })
}

// ============================================
// Capture Functions
// ============================================

/// Open and start a capture session for a window.
///
/// Returns null if the device cannot be created or the window cannot be
/// captured. A non-null handle must be released with release_capture().
#[unsafe(no_mangle)]
pub extern "C" fn init_capture(hwnd: *mut c_void) -> *mut CaptureHandle {
    open(&format!("window {:p}", hwnd), || {
        fg_capture::capture_window(hwnd, SessionConfig::default())
    })
}

/// Open and start a capture session for a monitor (0 is the primary).
#[unsafe(no_mangle)]
pub extern "C" fn init_capture_monitor(index: c_uint) -> *mut CaptureHandle {
    open(&format!("monitor {}", index), || {
        fg_capture::capture_monitor(index, SessionConfig::default())
    })
}

/// Copy the newest frame into `buffer` as packed BGRA.
///
/// Returns false when no frame is available, the buffer is too small or
/// the session has ended. On success and on a too-small buffer, `width`
/// and `height` receive the frame dimensions.
///
/// # Safety
/// - handle must come from init_capture() and not yet be released
/// - buffer must be valid for `capacity` bytes of writes
/// - width and height must be valid pointers or null
#[unsafe(no_mangle)]
pub unsafe extern "C" fn get_frame(
    handle: *mut CaptureHandle,
    buffer: *mut u8,
    capacity: usize,
    width: *mut c_int,
    height: *mut c_int,
) -> bool {
    let mut desc = CaptureFrameDesc::default();
    let status = unsafe { get_frame_ex(handle, buffer, capacity, &mut desc) };

    if matches!(status, CaptureStatus::Success | CaptureStatus::BufferTooSmall) {
        unsafe {
            if !width.is_null() {
                *width = to_c_int(desc.width);
            }
            if !height.is_null() {
                *height = to_c_int(desc.height);
            }
        }
    }

    status == CaptureStatus::Success
}

/// Copy the newest frame into `buffer`, reporting a status code.
///
/// On BufferTooSmall, `out_desc` carries the size the caller must allocate.
///
/// # Safety
/// - handle must come from init_capture() and not yet be released
/// - buffer must be valid for `capacity` bytes of writes
/// - out_desc must be a valid pointer or null
#[unsafe(no_mangle)]
pub unsafe extern "C" fn get_frame_ex(
    handle: *mut CaptureHandle,
    buffer: *mut u8,
    capacity: usize,
    out_desc: *mut CaptureFrameDesc,
) -> CaptureStatus {
    let Some(handle) = lookup(handle) else {
        return CaptureStatus::InvalidHandle;
    };
    if buffer.is_null() && capacity > 0 {
        return CaptureStatus::NullPointer;
    }

    guarded(CaptureStatus::Panic, || {
        let buf: &mut [u8] = if capacity == 0 {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(buffer, capacity) }
        };

        let (status, desc) = match handle.grab.read_into(buf) {
            Ok(info) => (
                CaptureStatus::Success,
                CaptureFrameDesc {
                    width: info.width,
                    height: info.height,
                    required_bytes: info.packed_len(),
                    sequence: info.sequence,
                },
            ),
            Err(CaptureError::BufferTooSmall { required, width, height, .. }) => (
                CaptureStatus::BufferTooSmall,
                CaptureFrameDesc {
                    width,
                    height,
                    required_bytes: required,
                    sequence: 0,
                },
            ),
            Err(e) => {
                if !e.is_transient() {
                    tracing::debug!("get_frame failed: {}", e);
                }
                (CaptureStatus::from(&e), CaptureFrameDesc::default())
            }
        };

        if !out_desc.is_null() {
            unsafe { *out_desc = desc };
        }
        status
    })
}

/// Get pool statistics
///
/// # Safety
/// - handle must come from init_capture() and not yet be released
/// - out_stats must be a valid pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn capture_get_stats(
    handle: *const CaptureHandle,
    out_stats: *mut CaptureStats,
) -> CaptureStatus {
    if out_stats.is_null() {
        return CaptureStatus::NullPointer;
    }
    let Some(handle) = lookup(handle) else {
        return CaptureStatus::InvalidHandle;
    };

    let stats = handle.grab.stats();
    let running = handle.grab.state() == fg_capture::SessionState::Running;
    unsafe {
        *out_stats = CaptureStats {
            frames_pushed: stats.pushed,
            frames_evicted: stats.evicted,
            frames_buffered: stats.buffered as u64,
            frames_live: stats.live as u64,
            running: running as c_int,
        };
    }

    CaptureStatus::Success
}

/// Stop the session and free its resources.
///
/// Null, unknown and already-released handles are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn release_capture(handle: *mut CaptureHandle) {
    if handle.is_null() {
        return;
    }

    let Some(handle) = handles().remove(&(handle as usize)) else {
        tracing::debug!("release_capture on unknown handle {:p}", handle);
        return;
    };

    guarded((), || {
        // Waits for in-flight get_frame calls to drop their frames.
        handle.grab.stop();
        tracing::info!("Capture released");
    });
}

// ============================================
// Utility Functions
// ============================================

/// Get the message for a status code
///
/// # Safety
/// - The returned string is static and must not be freed
#[unsafe(no_mangle)]
pub extern "C" fn capture_status_string(status: CaptureStatus) -> *const c_char {
    let msg = match status {
        CaptureStatus::Success => "Success\0",
        CaptureStatus::NoFrame => "No frame available\0",
        CaptureStatus::BufferTooSmall => "Buffer too small\0",
        CaptureStatus::SessionEnded => "Capture session has ended\0",
        CaptureStatus::InvalidHandle => "Invalid capture handle\0",
        CaptureStatus::NullPointer => "Null pointer\0",
        CaptureStatus::CaptureFailed => "Capture failed\0",
        CaptureStatus::Panic => "Internal panic\0",
    };

    msg.as_ptr() as *const c_char
}

/// Get library version
///
/// # Safety
/// - The returned string is static and must not be freed
#[unsafe(no_mangle)]
pub extern "C" fn capture_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::thread;
    use std::time::Duration;
    use fg_capture::synthetic::SyntheticSource;

    const RED: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

    fn synthetic_handle(width: u32, height: u32) -> *mut CaptureHandle {
        let source = SyntheticSource::new(width, height).with_color(RED);
        let grab = fg_capture::start_boxed(source, SessionConfig::default()).unwrap();
        register(grab)
    }

    fn poll_frame(handle: *mut CaptureHandle, buf: &mut [u8]) -> (c_int, c_int) {
        let (mut width, mut height) = (0, 0);
        for _ in 0..500 {
            let ok = unsafe { get_frame(handle, buf.as_mut_ptr(), buf.len(), &mut width, &mut height) };
            if ok {
                return (width, height);
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("no frame arrived");
    }

    #[test]
    fn test_release_null_is_noop() {
        release_capture(ptr::null_mut());
    }

    #[test]
    fn test_init_null_window_fails() {
        assert!(init_capture(ptr::null_mut()).is_null());
    }

    #[test]
    fn test_double_release_is_noop() {
        let handle = synthetic_handle(4, 4);
        release_capture(handle);
        release_capture(handle);

        let mut buf = [0u8; 64];
        let status = unsafe { get_frame_ex(handle, buf.as_mut_ptr(), buf.len(), ptr::null_mut()) };
        assert_eq!(status, CaptureStatus::InvalidHandle);
    }

    #[test]
    fn test_get_frame_copies_packed_bgra() {
        let handle = synthetic_handle(10, 10);
        let mut buf = vec![0u8; 10 * 10 * 4];

        let (width, height) = poll_frame(handle, &mut buf);
        assert_eq!((width, height), (10, 10));
        assert!(buf.chunks_exact(4).all(|px| px == RED));

        release_capture(handle);
    }

    #[test]
    fn test_small_buffer_reports_dimensions() {
        let handle = synthetic_handle(8, 6);
        let mut desc = CaptureFrameDesc::default();
        let mut small = [0xAAu8; 16];

        let mut status = CaptureStatus::NoFrame;
        for _ in 0..500 {
            status = unsafe { get_frame_ex(handle, small.as_mut_ptr(), small.len(), &mut desc) };
            if status != CaptureStatus::NoFrame {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(status, CaptureStatus::BufferTooSmall);
        assert_eq!((desc.width, desc.height), (8, 6));
        assert_eq!(desc.required_bytes, 8 * 6 * 4);
        assert!(small.iter().all(|&b| b == 0xAA));

        let (mut width, mut height) = (0, 0);
        let ok = unsafe { get_frame(handle, small.as_mut_ptr(), small.len(), &mut width, &mut height) };
        assert!(!ok);
        assert_eq!((width, height), (8, 6));

        release_capture(handle);
    }

    #[test]
    fn test_stats() {
        let handle = synthetic_handle(4, 4);
        let mut buf = vec![0u8; 4 * 4 * 4];
        poll_frame(handle, &mut buf);

        let mut stats = CaptureStats::default();
        let status = unsafe { capture_get_stats(handle, &mut stats) };
        assert_eq!(status, CaptureStatus::Success);
        assert!(stats.frames_pushed >= 1);
        assert!(stats.frames_buffered <= SessionConfig::default().pool_capacity as u64);
        assert_eq!(stats.running, 1);

        release_capture(handle);
        let status = unsafe { capture_get_stats(handle, &mut stats) };
        assert_eq!(status, CaptureStatus::InvalidHandle);
    }

    #[test]
    fn test_panic_is_caught_at_boundary() {
        let status = guarded(CaptureStatus::Panic, || -> CaptureStatus {
            panic!("reader blew up");
        });
        assert_eq!(status, CaptureStatus::Panic);
    }

    #[test]
    fn test_dimensions_saturate() {
        assert_eq!(to_c_int(1920), 1920);
        assert_eq!(to_c_int(c_int::MAX as c_uint), c_int::MAX);
        assert_eq!(to_c_int(c_uint::MAX), c_int::MAX);
    }

    #[test]
    fn test_status_strings() {
        let msg = unsafe { CStr::from_ptr(capture_status_string(CaptureStatus::BufferTooSmall)) };
        assert_eq!(msg.to_str().unwrap(), "Buffer too small");

        let version = unsafe { CStr::from_ptr(capture_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }
}
