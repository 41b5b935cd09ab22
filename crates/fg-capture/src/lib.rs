#[cfg(windows)]
pub mod win32;

pub mod config;
pub mod frame;
pub mod pool;
pub mod reader;
pub mod runtime;
pub mod session;
pub mod synthetic;
pub mod target;

use std::ffi::c_void;
use thiserror::Error;

pub use config::{ReadMode, SessionConfig};
pub use frame::{BYTES_PER_PIXEL, CpuSurface, Frame, MappedSurface, Surface};
pub use pool::{FramePool, PoolStats};
pub use reader::{FrameGrab, FrameInfo, FrameReader};
pub use runtime::RuntimeGuard;
pub use session::{CaptureSession, FrameSink, FrameSource, SessionState};
pub use target::{CaptureTarget, TargetKind};

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Platform not supported")]
    UnsupportedPlatform,

    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    #[error("Invalid capture target: {0}")]
    InvalidTarget(String),

    #[error("Session start failed: {0}")]
    SessionStart(String),

    #[error("Buffer too small: {required} bytes required for {width}x{height}, {capacity} provided")]
    BufferTooSmall {
        required: usize,
        capacity: usize,
        width: u32,
        height: u32,
    },

    #[error("No frame available")]
    NoFrame,

    #[error("Capture session has ended")]
    SessionEnded,

    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),
}

impl CaptureError {
    /// Errors the caller is expected to retry on its own polling cadence.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoFrame)
    }

    /// Errors raised while constructing or starting a session.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedPlatform
                | Self::DeviceCreation(_)
                | Self::InvalidTarget(_)
                | Self::SessionStart(_)
                | Self::InvalidConfig(_)
        )
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for CaptureError {
    fn from(e: windows::core::Error) -> Self {
        use windows::Win32::Graphics::Dxgi::{DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET};

        let code = e.code();
        if code == DXGI_ERROR_DEVICE_REMOVED || code == DXGI_ERROR_DEVICE_RESET {
            return CaptureError::DeviceLost(e.to_string());
        }
        CaptureError::CaptureFailed(e.to_string())
    }
}

/// Opens and starts a capture session for a native window handle.
pub fn capture_window(hwnd: *mut c_void, config: SessionConfig) -> Result<Box<dyn FrameGrab>> {
    config.validate()?;

    #[cfg(windows)]
    {
        let source = win32::WgcSource::for_window(hwnd, &config)?;
        start_boxed(source, config)
    }

    #[cfg(not(windows))]
    {
        let _ = hwnd;
        Err(CaptureError::UnsupportedPlatform)
    }
}

/// Opens and starts a capture session for the monitor at `index`
/// (0 is the primary monitor).
pub fn capture_monitor(index: u32, config: SessionConfig) -> Result<Box<dyn FrameGrab>> {
    config.validate()?;

    #[cfg(windows)]
    {
        let source = win32::WgcSource::for_monitor(index, &config)?;
        start_boxed(source, config)
    }

    #[cfg(not(windows))]
    {
        let _ = index;
        Err(CaptureError::UnsupportedPlatform)
    }
}

/// Wraps `source` in a session and starts it. On failure the session is
/// dropped, which releases everything the source acquired.
pub fn start_boxed<S>(source: S, config: SessionConfig) -> Result<Box<dyn FrameGrab>>
where
    S: FrameSource + 'static,
{
    let session = CaptureSession::new(source, config)?;
    session.start()?;
    Ok(Box::new(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(CaptureError::NoFrame.is_transient());
        assert!(!CaptureError::SessionEnded.is_transient());
        assert!(CaptureError::InvalidTarget("gone".into()).is_setup());
        assert!(!CaptureError::NoFrame.is_setup());
    }

    #[test]
    fn test_buffer_too_small_message() {
        let err = CaptureError::BufferTooSmall {
            required: 40000,
            capacity: 100,
            width: 100,
            height: 100,
        };
        assert_eq!(
            err.to_string(),
            "Buffer too small: 40000 bytes required for 100x100, 100 provided"
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn test_capture_window_unsupported() {
        let result = capture_window(std::ptr::null_mut(), SessionConfig::default());
        assert!(matches!(result, Err(CaptureError::UnsupportedPlatform)));
    }

    #[test]
    fn test_capture_rejects_bad_config() {
        let config = SessionConfig {
            pool_capacity: 0,
            ..Default::default()
        };
        let result = capture_monitor(0, config);
        assert!(matches!(result, Err(CaptureError::InvalidConfig(_))));
    }
}
