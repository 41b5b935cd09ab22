use std::mem::size_of;
use std::ptr;
use windows::core::BOOL;
use windows::Graphics::Capture::GraphicsCaptureItem;
use windows::Win32::Foundation::{LPARAM, POINT, RECT, TRUE};
use windows::Win32::Graphics::Gdi::{
    EnumDisplayMonitors, GetMonitorInfoW, MonitorFromPoint, HDC, HMONITOR, MONITORINFO,
    MONITOR_DEFAULTTONULL,
};
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use crate::target::{CaptureTarget, TargetKind};
use crate::{CaptureError, Result};

#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Monitor(HMONITOR);

// SAFETY: a monitor handle is a plain identifier usable from any thread.
unsafe impl Send for Monitor {}

impl Monitor {
    pub fn primary() -> Result<Self> {
        let point = POINT { x: 0, y: 0 };
        let monitor = unsafe { MonitorFromPoint(point, MONITOR_DEFAULTTONULL) };

        if monitor.is_invalid() {
            return Err(CaptureError::InvalidTarget("no primary monitor".into()));
        }

        Ok(Self(monitor))
    }

    /// Monitor at `index` in enumeration order, with the primary monitor
    /// always at index 0.
    pub fn from_index(index: u32) -> Result<Self> {
        let primary = Self::primary()?;
        if index == 0 {
            return Ok(primary);
        }

        Self::enumerate()?
            .into_iter()
            .filter(|m| *m != primary)
            .nth(index as usize - 1)
            .ok_or_else(|| CaptureError::InvalidTarget(format!("no monitor at index {}", index)))
    }

    pub fn enumerate() -> Result<Vec<Self>> {
        let mut monitors: Vec<Self> = Vec::new();

        unsafe {
            EnumDisplayMonitors(
                None,
                None,
                Some(Self::enum_monitors_callback),
                LPARAM(ptr::addr_of_mut!(monitors) as isize),
            )
            .ok()?;
        }

        Ok(monitors)
    }

    unsafe extern "system" fn enum_monitors_callback(
        monitor: HMONITOR,
        _: HDC,
        _: *mut RECT,
        vec: LPARAM,
    ) -> BOOL {
        let monitors = unsafe { &mut *(vec.0 as *mut Vec<Self>) };
        monitors.push(Self(monitor));
        TRUE
    }

    /// Live desktop size of the monitor.
    pub fn size(&self) -> Result<(u32, u32)> {
        let mut info = MONITORINFO {
            cbSize: size_of::<MONITORINFO>() as u32,
            ..Default::default()
        };
        if !unsafe { GetMonitorInfoW(self.0, &mut info) }.as_bool() {
            return Err(CaptureError::InvalidTarget("GetMonitorInfoW failed".into()));
        }

        let rect = info.rcMonitor;
        Ok((
            (rect.right - rect.left).max(0) as u32,
            (rect.bottom - rect.top).max(0) as u32,
        ))
    }

    pub fn to_target(self) -> Result<CaptureTarget> {
        let (width, height) = self.size()?;
        Ok(CaptureTarget::new(
            TargetKind::Monitor,
            self.0.0 as usize,
            width,
            height,
        ))
    }

    pub const fn from_ptr(hmonitor: *mut std::ffi::c_void) -> Self {
        Self(HMONITOR(hmonitor))
    }
}

impl TryFrom<Monitor> for GraphicsCaptureItem {
    type Error = CaptureError;

    fn try_from(monitor: Monitor) -> Result<GraphicsCaptureItem> {
        let interop = windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
            .map_err(|e| CaptureError::SessionStart(format!("capture interop: {}", e)))?;
        unsafe { interop.CreateForMonitor(monitor.0) }
            .map_err(|e| CaptureError::SessionStart(format!("CreateForMonitor: {}", e)))
    }
}
