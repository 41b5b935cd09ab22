use std::ffi::c_void;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use windows::core::{Interface, Ref};
use windows::Foundation::TypedEventHandler;
use windows::Graphics::Capture::{Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession};
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::System::WinRT::Direct3D11::IDirect3DDxgiInterfaceAccess;
use crate::config::SessionConfig;
use crate::frame::{BYTES_PER_PIXEL, Frame};
use crate::pool::lock;
use crate::runtime::RuntimeGuard;
use crate::session::{FrameSink, FrameSource};
use crate::target::CaptureTarget;
use crate::win32::d3d11::{texture_size, DeviceContext, StagingSurface};
use crate::win32::frame_pool::{self, EventCallbackFn, OsFramePool};
use crate::win32::monitor::Monitor;
use crate::win32::window::Window;
use crate::{CaptureError, Result};

#[derive(Debug, Clone, Copy)]
enum CaptureItem {
    Window(Window),
    Monitor(Monitor),
}

impl CaptureItem {
    fn validate(&self) -> Result<()> {
        match self {
            CaptureItem::Window(window) => window.check_capturable(),
            CaptureItem::Monitor(monitor) => monitor.size().map(|_| ()),
        }
    }

    fn to_winrt(self) -> Result<GraphicsCaptureItem> {
        match self {
            CaptureItem::Window(window) => window.try_into(),
            CaptureItem::Monitor(monitor) => monitor.try_into(),
        }
    }
}

/// Windows Graphics Capture stream for one window or monitor.
pub struct WgcSource {
    target: CaptureTarget,
    item: CaptureItem,
    device: Option<Arc<DeviceContext>>,
    os_pool: Option<OsFramePool>,
    // Held by the arrival callback for its whole run; `false` once stopped.
    gate: Arc<Mutex<bool>>,
    buffers: u32,
    runtime: Option<RuntimeGuard>,
}

// SAFETY: the WinRT capture objects are agile, window and monitor handles
// are plain identifiers, and the device is Send + Sync.
unsafe impl Send for WgcSource {}

fn check_support() -> Result<()> {
    let supported = GraphicsCaptureSession::IsSupported()
        .map_err(|e| CaptureError::SessionStart(format!("IsSupported: {}", e)))?;
    if supported {
        Ok(())
    } else {
        Err(CaptureError::UnsupportedPlatform)
    }
}

impl WgcSource {
    pub fn for_window(hwnd: *mut c_void, config: &SessionConfig) -> Result<Self> {
        let runtime = RuntimeGuard::acquire()?;
        check_support()?;

        let window = Window::from_ptr(hwnd);
        let target = window.to_target()?;
        info!("Capturing window {:?} ({:?})", window.title().unwrap_or_default(), target);

        Self::new(target, CaptureItem::Window(window), config, runtime)
    }

    pub fn for_monitor(index: u32, config: &SessionConfig) -> Result<Self> {
        let runtime = RuntimeGuard::acquire()?;
        check_support()?;

        let monitor = Monitor::from_index(index)?;
        let target = monitor.to_target()?;
        info!("Capturing monitor {} ({:?})", index, target);

        Self::new(target, CaptureItem::Monitor(monitor), config, runtime)
    }

    fn new(
        target: CaptureTarget,
        item: CaptureItem,
        config: &SessionConfig,
        runtime: RuntimeGuard,
    ) -> Result<Self> {
        let device = DeviceContext::create(config.software_fallback, config.pool_capacity + 1)?;

        Ok(Self {
            target,
            item,
            device: Some(Arc::new(device)),
            os_pool: None,
            gate: Arc::new(Mutex::new(true)),
            buffers: config.os_buffers,
            runtime: Some(runtime),
        })
    }

    pub fn device(&self) -> Option<&Arc<DeviceContext>> {
        self.device.as_ref()
    }
}

impl FrameSource for WgcSource {
    type Surface = StagingSurface;

    fn target(&self) -> &CaptureTarget {
        &self.target
    }

    fn validate(&self) -> Result<()> {
        self.item.validate()
    }

    fn start(&mut self, sink: FrameSink<StagingSurface>) -> Result<()> {
        let device = self
            .device
            .clone()
            .ok_or_else(|| CaptureError::SessionStart("device already released".into()))?;

        let item = self.item.to_winrt()?;
        let mut os_pool = OsFramePool::new(&device, &item, self.buffers)?;

        os_pool.set_frame_arrived(on_frame_arrived(
            device,
            sink.clone(),
            self.target.clone(),
            self.gate.clone(),
            self.buffers,
        ))?;
        os_pool.set_closed(on_capture_closed(sink))?;

        // Fails for policy-protected content.
        os_pool.start()?;
        info!("Graphics capture started");

        self.os_pool = Some(os_pool);
        Ok(())
    }

    fn stop(&mut self) {
        *lock(&self.gate) = false;
        if let Some(os_pool) = self.os_pool.take() {
            drop(os_pool);
            info!("Graphics capture stopped");
        }
    }

    fn release(&mut self) {
        if let Some(device) = self.device.take() {
            device.release();
            debug!("D3D11 device released");
        }
        self.runtime.take();
    }
}

fn on_frame_arrived(
    device: Arc<DeviceContext>,
    sink: FrameSink<StagingSurface>,
    target: CaptureTarget,
    gate: Arc<Mutex<bool>>,
    buffers: u32,
) -> EventCallbackFn<Direct3D11CaptureFramePool> {
    TypedEventHandler::new(move |pool: Ref<Direct3D11CaptureFramePool>, _| {
        let open = lock(&gate);
        if !*open {
            return Ok(());
        }

        let Some(pool) = pool.as_ref() else {
            return Ok(());
        };

        // Only the newest frame matters; older ones go straight back to the OS.
        let mut newest: Option<Direct3D11CaptureFrame> = None;
        while let Ok(frame) = pool.TryGetNextFrame() {
            if let Some(previous) = newest.replace(frame) {
                let _ = previous.Close();
            }
        }

        let Some(frame) = newest else {
            return Ok(());
        };

        let result = stage_frame(&device, &frame, pool, &target, &sink, buffers);
        // Returns the surface to the OS pool for the next write.
        let _ = frame.Close();

        match result {
            Ok(()) => {}
            Err(CaptureError::DeviceLost(reason)) => {
                sink.end(&format!("GPU device lost: {}", reason));
            }
            Err(e) => debug!("Dropped captured frame: {}", e),
        }

        Ok(())
    })
}

/// GPU-side copy of the OS surface into a staging texture. No pixel data
/// touches the CPU here.
fn stage_frame(
    device: &Arc<DeviceContext>,
    frame: &Direct3D11CaptureFrame,
    pool: &Direct3D11CaptureFramePool,
    target: &CaptureTarget,
    sink: &FrameSink<StagingSurface>,
    buffers: u32,
) -> Result<()> {
    let content = frame.ContentSize()?;
    let content_width = content.Width.max(0) as u32;
    let content_height = content.Height.max(0) as u32;

    if target.update_size(content_width, content_height) {
        info!("Capture target resized to {}x{}", content_width, content_height);
        frame_pool::recreate(pool, device, buffers, content)?;
    }

    let access: IDirect3DDxgiInterfaceAccess = frame.Surface()?.cast()?;
    let texture: ID3D11Texture2D = unsafe { access.GetInterface()? };
    let (tex_width, tex_height) = texture_size(&texture);

    let width = content_width.min(tex_width);
    let height = content_height.min(tex_height);
    if width == 0 || height == 0 {
        return Ok(());
    }

    let staging = device.acquire_staging(tex_width, tex_height)?;
    device.with_context(|ctx| unsafe { ctx.CopyResource(&staging, &texture) });

    let stride = tex_width * BYTES_PER_PIXEL as u32;
    sink.push(Frame::new(
        StagingSurface::new(staging, device.clone()),
        width,
        height,
        stride,
    ));
    Ok(())
}

fn on_capture_closed(sink: FrameSink<StagingSurface>) -> EventCallbackFn<GraphicsCaptureItem> {
    TypedEventHandler::new(move |_, _| {
        sink.end("capture item closed by the system");
        Ok(())
    })
}
