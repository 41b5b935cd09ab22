use std::ptr;
use windows::core::BOOL;
use windows::Graphics::Capture::GraphicsCaptureItem;
use windows::Win32::Foundation::{HWND, LPARAM, RECT, TRUE};
use windows::Win32::System::Threading::GetCurrentProcessId;
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use windows::Win32::UI::WindowsAndMessaging::{
    EnumChildWindows, GetClientRect, GetDesktopWindow, GetWindowLongPtrW, GetWindowTextLengthW,
    GetWindowTextW, GetWindowThreadProcessId, IsIconic, IsWindow, IsWindowVisible, GWL_EXSTYLE,
    GWL_STYLE, WS_CHILD, WS_EX_TOOLWINDOW,
};
use crate::target::{CaptureTarget, TargetKind};
use crate::{CaptureError, Result};

#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Window(HWND);

// SAFETY: a window handle is a plain identifier usable from any thread.
unsafe impl Send for Window {}

impl Window {
    pub const fn from_ptr(hwnd: *mut std::ffi::c_void) -> Self {
        Self(HWND(hwnd))
    }

    #[inline]
    pub const fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.0.0
    }

    /// First top-level window whose title contains `title`.
    pub fn from_contains_name(title: &str) -> Result<Self> {
        for window in Self::enumerate()? {
            if window.title()?.contains(title) {
                return Ok(window);
            }
        }

        Err(CaptureError::InvalidTarget(format!(
            "no window title contains {:?}",
            title
        )))
    }

    pub fn title(&self) -> Result<String> {
        let len = unsafe { GetWindowTextLengthW(self.0) };
        if len <= 0 {
            return Ok(String::new());
        }

        let mut buf = vec![0u16; len as usize + 1];
        let copied = unsafe { GetWindowTextW(self.0, &mut buf) };
        if copied <= 0 {
            return Ok(String::new());
        }

        String::from_utf16(&buf[..copied as usize])
            .map_err(|_| CaptureError::CaptureFailed("window title is not valid UTF-16".into()))
    }

    /// Live client-area size.
    pub fn client_size(&self) -> Result<(u32, u32)> {
        let mut rect = RECT::default();
        unsafe { GetClientRect(self.0, &mut rect) }
            .map_err(|e| CaptureError::InvalidTarget(format!("GetClientRect: {}", e)))?;

        let width = (rect.right - rect.left).max(0) as u32;
        let height = (rect.bottom - rect.top).max(0) as u32;
        Ok((width, height))
    }

    /// Whether the handle refers to a window that can be captured right
    /// now: it exists, is visible and is not minimized.
    pub fn check_capturable(&self) -> Result<()> {
        if self.0.0.is_null() {
            return Err(CaptureError::InvalidTarget("window handle is null".into()));
        }
        if !unsafe { IsWindow(Some(self.0)) }.as_bool() {
            return Err(CaptureError::InvalidTarget(format!(
                "{:?} is not a window",
                self.0
            )));
        }
        if unsafe { IsIconic(self.0) }.as_bool() {
            return Err(CaptureError::InvalidTarget("window is minimized".into()));
        }
        if !unsafe { IsWindowVisible(self.0) }.as_bool() {
            return Err(CaptureError::InvalidTarget("window is not visible".into()));
        }
        Ok(())
    }

    /// Candidate for window pickers: visible, top-level, not a tool window
    /// and not owned by this process.
    fn is_listable(&self) -> bool {
        if !unsafe { IsWindowVisible(self.0).as_bool() } {
            return false;
        }

        let mut id = 0;
        unsafe { GetWindowThreadProcessId(self.0, Some(&mut id)) };
        if id == unsafe { GetCurrentProcessId() } {
            return false;
        }

        let styles = unsafe { GetWindowLongPtrW(self.0, GWL_STYLE) } as isize;
        let ex_styles = unsafe { GetWindowLongPtrW(self.0, GWL_EXSTYLE) } as isize;

        if (ex_styles & WS_EX_TOOLWINDOW.0 as isize) != 0 {
            return false;
        }
        if (styles & WS_CHILD.0 as isize) != 0 {
            return false;
        }

        true
    }

    pub fn enumerate() -> Result<Vec<Self>> {
        let mut windows: Vec<Self> = Vec::new();

        unsafe {
            EnumChildWindows(
                Some(GetDesktopWindow()),
                Some(Self::enum_windows_callback),
                LPARAM(ptr::addr_of_mut!(windows) as isize),
            )
            .ok()?;
        };

        Ok(windows)
    }

    unsafe extern "system" fn enum_windows_callback(window: HWND, vec: LPARAM) -> BOOL {
        let windows = unsafe { &mut *(vec.0 as *mut Vec<Self>) };

        let window = Self(window);
        if window.is_listable() {
            windows.push(window);
        }

        TRUE
    }

    /// Validates the window and snapshots its size into a target.
    pub fn to_target(self) -> Result<CaptureTarget> {
        self.check_capturable()?;
        let (width, height) = self.client_size()?;
        Ok(CaptureTarget::new(
            TargetKind::Window,
            self.as_ptr() as usize,
            width,
            height,
        ))
    }
}

impl TryFrom<Window> for GraphicsCaptureItem {
    type Error = CaptureError;

    fn try_from(window: Window) -> Result<GraphicsCaptureItem> {
        let interop = windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
            .map_err(|e| CaptureError::SessionStart(format!("capture interop: {}", e)))?;
        unsafe { interop.CreateForWindow(window.0) }
            .map_err(|e| CaptureError::SessionStart(format!("CreateForWindow: {}", e)))
    }
}
