use std::sync::Mutex;
use tracing::{debug, info};
use crate::pool::lock;
use crate::Result;

#[cfg(windows)]
type PlatformToken = windows::Win32::System::Com::CO_MTA_USAGE_COOKIE;
#[cfg(not(windows))]
type PlatformToken = ();

struct RuntimeState {
    users: usize,
    token: Option<PlatformToken>,
}

// SAFETY: the MTA usage cookie is a plain handle value that may be released
// from any thread.
#[cfg(windows)]
unsafe impl Send for RuntimeState {}

static RUNTIME: Mutex<RuntimeState> = Mutex::new(RuntimeState {
    users: 0,
    token: None,
});

/// Reference-counted, process-wide capture runtime initialization.
///
/// The first guard brings the runtime up and the last one to drop tears it
/// down, so concurrent sessions never double-initialize or tear down under
/// each other.
#[derive(Debug)]
#[must_use]
pub struct RuntimeGuard {
    _private: (),
}

impl RuntimeGuard {
    pub fn acquire() -> Result<Self> {
        let mut state = lock(&RUNTIME);
        if state.users == 0 {
            state.token = Some(platform_init()?);
            info!("Capture runtime initialized");
        }
        state.users += 1;
        debug!("Capture runtime users: {}", state.users);
        Ok(Self { _private: () })
    }

    /// Number of live guards in the process.
    pub fn active() -> usize {
        lock(&RUNTIME).users
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        let mut state = lock(&RUNTIME);
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            if let Some(token) = state.token.take() {
                platform_shutdown(token);
                info!("Capture runtime shut down");
            }
        }
    }
}

#[cfg(windows)]
fn platform_init() -> Result<PlatformToken> {
    use windows::Win32::System::Com::CoIncrementMTAUsage;

    // Keeps a multithreaded apartment alive for the process, so the capture
    // callback and reader threads can use WinRT objects without per-thread
    // initialization.
    let cookie = unsafe { CoIncrementMTAUsage() }
        .map_err(|e| crate::CaptureError::SessionStart(format!("CoIncrementMTAUsage: {}", e)))?;
    Ok(cookie)
}

#[cfg(windows)]
fn platform_shutdown(token: PlatformToken) {
    use windows::Win32::System::Com::CoDecrementMTAUsage;

    if let Err(e) = unsafe { CoDecrementMTAUsage(token) } {
        tracing::warn!("CoDecrementMTAUsage failed: {}", e);
    }
}

#[cfg(not(windows))]
fn platform_init() -> Result<PlatformToken> {
    Ok(())
}

#[cfg(not(windows))]
fn platform_shutdown(_token: PlatformToken) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // Other tests in this binary acquire guards through sessions, so only
    // relative counts are asserted.
    #[test]
    fn test_guards_are_counted() {
        let a = RuntimeGuard::acquire().unwrap();
        let b = RuntimeGuard::acquire().unwrap();
        assert!(RuntimeGuard::active() >= 2);
        drop(a);
        assert!(RuntimeGuard::active() >= 1);
        drop(b);
    }

    #[test]
    fn test_concurrent_acquire() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    for _ in 0..100 {
                        let guard = RuntimeGuard::acquire().unwrap();
                        assert!(RuntimeGuard::active() >= 1);
                        drop(guard);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
