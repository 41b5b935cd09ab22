mod d3d11;
mod frame_pool;
mod gfx_capture;
mod monitor;
mod window;

pub use d3d11::{DeviceContext, DriverKind, StagingSurface};
pub use gfx_capture::WgcSource;
pub use monitor::Monitor;
pub use window::Window;

use crate::Result;

/// Capturable top-level windows as `(handle, title)` pairs.
pub fn list_windows() -> Result<Vec<(usize, String)>> {
    let mut out = Vec::new();
    for window in Window::enumerate()? {
        let title = window.title()?;
        if !title.is_empty() {
            out.push((window.as_ptr() as usize, title));
        }
    }
    Ok(out)
}
