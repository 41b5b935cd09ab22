use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_CPU_ACCESS_READ,
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ, D3D11_SDK_VERSION,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE, D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP, D3D_FEATURE_LEVEL_11_0,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::IDXGIDevice;
use windows::Win32::System::WinRT::Direct3D11::CreateDirect3D11DeviceFromDXGIDevice;
use crate::frame::{MappedSurface, Surface};
use crate::pool::lock;
use crate::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Hardware,
    /// WARP software rasterizer.
    Software,
}

/// GPU device and immediate context used for every capture operation of one
/// session.
///
/// The immediate context is not thread-safe, so every call on it goes
/// through [`DeviceContext::with_context`]. Staging textures are recycled
/// through a small cache that is emptied on [`DeviceContext::release`].
pub struct DeviceContext {
    device: ID3D11Device,
    context: Mutex<ID3D11DeviceContext>,
    winrt: IDirect3DDevice,
    driver: DriverKind,
    staging: Mutex<Vec<ID3D11Texture2D>>,
    staging_limit: usize,
    released: AtomicBool,
}

// SAFETY: ID3D11Device is free-threaded, the immediate context is only
// reached through the mutex, and IDirect3DDevice is agile.
unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl DeviceContext {
    /// Creates a hardware device, falling back to WARP when no hardware
    /// adapter is usable and `software_fallback` is set.
    pub fn create(software_fallback: bool, staging_limit: usize) -> Result<Self> {
        let (device, context, driver) = match create_device(D3D_DRIVER_TYPE_HARDWARE) {
            Ok((device, context)) => (device, context, DriverKind::Hardware),
            Err(e) if software_fallback => {
                warn!("Hardware D3D11 device unavailable ({}), falling back to WARP", e);
                let (device, context) = create_device(D3D_DRIVER_TYPE_WARP)?;
                (device, context, DriverKind::Software)
            }
            Err(e) => return Err(e),
        };

        let winrt = to_winrt(&device)?;
        info!("D3D11 device created ({:?})", driver);

        Ok(Self {
            device,
            context: Mutex::new(context),
            winrt,
            driver,
            staging: Mutex::new(Vec::new()),
            staging_limit,
            released: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    /// The device as seen by the WinRT capture API.
    #[inline]
    pub fn winrt(&self) -> &IDirect3DDevice {
        &self.winrt
    }

    #[inline]
    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    /// Runs `f` with exclusive use of the immediate context.
    pub fn with_context<T>(&self, f: impl FnOnce(&ID3D11DeviceContext) -> T) -> T {
        let ctx = lock(&self.context);
        f(&ctx)
    }

    /// A CPU-readable BGRA texture of the given size, reused when possible.
    pub fn acquire_staging(&self, width: u32, height: u32) -> Result<ID3D11Texture2D> {
        {
            let mut cache = lock(&self.staging);
            if let Some(idx) = cache.iter().position(|t| texture_size(t) == (width, height)) {
                return Ok(cache.swap_remove(idx));
            }
        }

        debug!("Allocating {}x{} staging texture", width, height);
        create_staging(&self.device, width, height)
    }

    fn recycle_staging(&self, texture: ID3D11Texture2D) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        let mut cache = lock(&self.staging);
        if cache.len() < self.staging_limit {
            cache.push(texture);
        }
    }

    /// Drops cached textures. Called once no frame references this device.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
        let dropped = std::mem::take(&mut *lock(&self.staging));
        debug!("Released {} cached staging texture(s)", dropped.len());
    }
}

fn create_device(driver: D3D_DRIVER_TYPE) -> Result<(ID3D11Device, ID3D11DeviceContext)> {
    let mut device = None;
    let mut ctx = None;

    unsafe {
        D3D11CreateDevice(
            None,
            driver,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&[D3D_FEATURE_LEVEL_11_0]),
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut ctx),
        )
    }
    .map_err(|e| CaptureError::DeviceCreation(format!("D3D11CreateDevice: {}", e)))?;

    match (device, ctx) {
        (Some(device), Some(ctx)) => Ok((device, ctx)),
        _ => Err(CaptureError::DeviceCreation(
            "D3D11CreateDevice returned no device".into(),
        )),
    }
}

fn to_winrt(device: &ID3D11Device) -> Result<IDirect3DDevice> {
    let dxgi_device: IDXGIDevice = device
        .cast()
        .map_err(|e| CaptureError::DeviceCreation(format!("IDXGIDevice cast: {}", e)))?;
    let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device) }
        .map_err(|e| CaptureError::DeviceCreation(format!("WinRT device: {}", e)))?;
    inspectable
        .cast()
        .map_err(|e| CaptureError::DeviceCreation(format!("IDirect3DDevice cast: {}", e)))
}

fn create_staging(device: &ID3D11Device, width: u32, height: u32) -> Result<ID3D11Texture2D> {
    let desc = D3D11_TEXTURE2D_DESC {
        Width: width,
        Height: height,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage: D3D11_USAGE_STAGING,
        BindFlags: 0,
        CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
        MiscFlags: 0,
    };

    let mut tex = None;
    unsafe {
        device.CreateTexture2D(&desc, None, Some(&mut tex))?;
    }
    tex.ok_or_else(|| CaptureError::CaptureFailed("CreateTexture2D returned no texture".into()))
}

pub(crate) fn texture_size(texture: &ID3D11Texture2D) -> (u32, u32) {
    let mut desc = D3D11_TEXTURE2D_DESC::default();
    unsafe { texture.GetDesc(&mut desc) };
    (desc.Width, desc.Height)
}

/// A captured image copied into a staging texture. Returns the texture to
/// the device's cache when dropped.
pub struct StagingSurface {
    texture: Option<ID3D11Texture2D>,
    height: u32,
    device: Arc<DeviceContext>,
}

// SAFETY: the texture is only touched through the device's context lock.
unsafe impl Send for StagingSurface {}
unsafe impl Sync for StagingSurface {}

impl StagingSurface {
    pub fn new(texture: ID3D11Texture2D, device: Arc<DeviceContext>) -> Self {
        let (_, height) = texture_size(&texture);
        Self {
            texture: Some(texture),
            height,
            device,
        }
    }
}

impl Surface for StagingSurface {
    fn map(&self) -> Result<MappedSurface<'_>> {
        let texture = self
            .texture
            .as_ref()
            .ok_or_else(|| CaptureError::CaptureFailed("staging texture already released".into()))?;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        self.device
            .with_context(|ctx| unsafe { ctx.Map(texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) })?;

        let row_pitch = mapped.RowPitch as usize;
        let len = row_pitch * self.height as usize;
        // SAFETY: the mapping covers RowPitch * Height bytes and stays valid
        // until Unmap, which runs when the returned guard is dropped.
        let data = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };

        let device = &self.device;
        Ok(MappedSurface::new(data, row_pitch).with_unmap(move || {
            device.with_context(|ctx| unsafe { ctx.Unmap(texture, 0) });
        }))
    }
}

impl Drop for StagingSurface {
    fn drop(&mut self) {
        if let Some(texture) = self.texture.take() {
            self.device.recycle_staging(texture);
        }
    }
}
