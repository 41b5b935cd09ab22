use windows::core::IInspectable;
use windows::Foundation::TypedEventHandler;
use windows::Graphics::Capture::{Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession};
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use crate::win32::d3d11::DeviceContext;
use crate::{CaptureError, Result};

pub type EventCallbackToken = i64;
pub type EventCallbackFn<Sender> = TypedEventHandler<Sender, IInspectable>;

pub const PIXEL_FORMAT: DirectXPixelFormat = DirectXPixelFormat::B8G8R8A8UIntNormalized;

/// The OS-side frame pool and capture session for one item, with the event
/// registrations that must be undone before either is closed.
#[derive(Debug)]
pub(crate) struct OsFramePool {
    pool: Direct3D11CaptureFramePool,
    session: GraphicsCaptureSession,
    item: GraphicsCaptureItem,
    frame_arrived: Option<EventCallbackToken>,
    closed: Option<EventCallbackToken>,
}

impl OsFramePool {
    /// Free-threaded pool: arrival callbacks run on a system thread rather
    /// than needing a dispatcher on the creating thread.
    pub fn new(device: &DeviceContext, item: &GraphicsCaptureItem, buffers: u32) -> Result<Self> {
        let size = item.Size()?;
        let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            device.winrt(),
            PIXEL_FORMAT,
            buffers as i32,
            size,
        )
        .map_err(|e| CaptureError::SessionStart(format!("CreateFreeThreaded: {}", e)))?;

        let session = pool
            .CreateCaptureSession(item)
            .map_err(|e| CaptureError::SessionStart(format!("CreateCaptureSession: {}", e)))?;

        Ok(Self {
            pool,
            session,
            item: item.clone(),
            frame_arrived: None,
            closed: None,
        })
    }

    pub fn set_frame_arrived(&mut self, handler: EventCallbackFn<Direct3D11CaptureFramePool>) -> Result<()> {
        self.frame_arrived = Some(self.pool.FrameArrived(&handler)?);
        Ok(())
    }

    pub fn set_closed(&mut self, handler: EventCallbackFn<GraphicsCaptureItem>) -> Result<()> {
        self.closed = Some(self.item.Closed(&handler)?);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.session
            .StartCapture()
            .map_err(|e| CaptureError::SessionStart(format!("StartCapture: {}", e)))
    }

    /// Unregisters both callbacks. A callback already running may still finish.
    pub fn unregister(&mut self) {
        if let Some(token) = self.frame_arrived.take() {
            let _ = self.pool.RemoveFrameArrived(token);
        }
        if let Some(token) = self.closed.take() {
            let _ = self.item.RemoveClosed(token);
        }
    }
}

/// Reallocates the OS surfaces for a new content size. Called from the
/// arrival callback with the pool that raised it.
pub(crate) fn recreate(
    pool: &Direct3D11CaptureFramePool,
    device: &DeviceContext,
    buffers: u32,
    size: SizeInt32,
) -> Result<()> {
    pool.Recreate(device.winrt(), PIXEL_FORMAT, buffers as i32, size)?;
    Ok(())
}

impl Drop for OsFramePool {
    fn drop(&mut self) {
        self.unregister();
        let _ = self.session.Close();
        let _ = self.pool.Close();
    }
}
