use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use crate::config::SessionConfig;
use crate::frame::{Frame, Surface};
use crate::pool::{lock, FramePool, PoolStats};
use crate::reader::FrameReader;
use crate::target::CaptureTarget;
use crate::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
}

/// Producer-side handle given to a [`FrameSource`]. Safe to use from any
/// thread, including threads the OS owns.
pub struct FrameSink<S> {
    pool: Arc<FramePool<S>>,
}

impl<S> Clone for FrameSink<S> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<S: Surface> FrameSink<S> {
    pub(crate) fn new(pool: Arc<FramePool<S>>) -> Self {
        Self { pool }
    }

    /// Hands a newly captured frame to readers. Returns `false` once the
    /// session no longer accepts frames.
    pub fn push(&self, frame: Frame<S>) -> bool {
        self.pool.push(frame)
    }

    /// Reports that the stream terminated on its own (device lost, target
    /// closed). Readers see [`CaptureError::SessionEnded`] from then on.
    pub fn end(&self, reason: &str) {
        if !self.pool.is_closed() {
            warn!("Capture stream ended: {}", reason);
            self.pool.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// The OS capture stream behind a session.
///
/// Lifecycle calls are serialized by the session: `validate` and `start`
/// at most once, then `stop` followed by `release`.
pub trait FrameSource: Send {
    type Surface: Surface + 'static;

    fn target(&self) -> &CaptureTarget;

    /// Checks that the target can still be captured.
    fn validate(&self) -> Result<()>;

    /// Begins delivering frames into `sink` from any thread.
    fn start(&mut self, sink: FrameSink<Self::Surface>) -> Result<()>;

    /// Stops delivery. No frame is pushed after this returns.
    fn stop(&mut self);

    /// Releases the device and remaining OS resources. Called only after
    /// every frame produced by this source has been dropped.
    fn release(&mut self);
}

struct SessionInner<S> {
    source: Option<S>,
    state: SessionState,
}

/// Binds a target, device and frame pool, and drives the
/// `Created -> Running -> Stopped` lifecycle.
pub struct CaptureSession<S: FrameSource> {
    inner: Mutex<SessionInner<S>>,
    pool: Arc<FramePool<S::Surface>>,
    config: SessionConfig,
}

impl<S: FrameSource> CaptureSession<S> {
    pub fn new(source: S, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Mutex::new(SessionInner {
                source: Some(source),
                state: SessionState::Created,
            }),
            pool: Arc::new(FramePool::new(config.pool_capacity)),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state. A stream that ended on its own reports `Stopped`.
    pub fn state(&self) -> SessionState {
        let state = lock(&self.inner).state;
        if state == SessionState::Running && self.pool.is_closed() {
            SessionState::Stopped
        } else {
            state
        }
    }

    pub fn target(&self) -> Option<CaptureTarget> {
        lock(&self.inner)
            .source
            .as_ref()
            .map(|source| source.target().clone())
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = lock(&self.inner);

        match inner.state {
            SessionState::Created => {}
            SessionState::Running => {
                return Err(CaptureError::SessionStart("session already running".into()));
            }
            SessionState::Stopped => {
                return Err(CaptureError::SessionStart(
                    "session is stopped; create a new one".into(),
                ));
            }
        }

        let result = match inner.source.as_mut() {
            Some(source) => source
                .validate()
                .and_then(|_| source.start(FrameSink::new(self.pool.clone()))),
            None => Err(CaptureError::SessionStart("session has no source".into())),
        };

        match result {
            Ok(()) => {
                inner.state = SessionState::Running;
                info!("Capture session started");
                Ok(())
            }
            Err(e) => {
                warn!("Capture session failed to start: {}", e);
                let source = Self::begin_stop(&mut inner);
                drop(inner);
                self.shutdown(source);
                Err(match e {
                    CaptureError::InvalidTarget(msg) => CaptureError::SessionStart(msg),
                    other => other,
                })
            }
        }
    }

    /// Stops capture and releases every resource. Waits for readers that
    /// still hold frames, without holding the session lock, so those readers
    /// can still query the session. Calling it again is a no-op.
    pub fn stop(&self) {
        let source = Self::begin_stop(&mut lock(&self.inner));
        if source.is_none() {
            debug!("Capture session already stopped");
            return;
        }
        self.shutdown(source);
        info!("Capture session stopped");
    }

    fn begin_stop(inner: &mut SessionInner<S>) -> Option<S> {
        inner.state = SessionState::Stopped;
        inner.source.take()
    }

    // Order: stop delivery, drop buffered frames, wait for readers, then
    // release the device.
    fn shutdown(&self, source: Option<S>) {
        if let Some(mut source) = source {
            source.stop();
            self.pool.close();
            self.pool.wait_idle();
            source.release();
        }
        self.pool.close();
    }

    pub fn reader(&self) -> FrameReader<S::Surface> {
        FrameReader::new(self.pool.clone(), self.config.read_mode)
    }

    pub fn pool(&self) -> &Arc<FramePool<S::Surface>> {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl<S: FrameSource> Drop for CaptureSession<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use crate::frame::CpuSurface;
    use crate::synthetic::SyntheticSource;
    use crate::target::TargetKind;

    /// Records the order of lifecycle calls made by the session.
    struct ScriptedSource {
        target: CaptureTarget,
        valid: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
        sink: Option<FrameSink<CpuSurface>>,
    }

    impl ScriptedSource {
        fn new(valid: bool) -> (Self, Arc<Mutex<Vec<&'static str>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let source = Self {
                target: CaptureTarget::new(TargetKind::Window, 1, 4, 4),
                valid,
                log: log.clone(),
                sink: None,
            };
            (source, log)
        }
    }

    impl FrameSource for ScriptedSource {
        type Surface = CpuSurface;

        fn target(&self) -> &CaptureTarget {
            &self.target
        }

        fn validate(&self) -> Result<()> {
            self.log.lock().unwrap().push("validate");
            if self.valid {
                Ok(())
            } else {
                Err(CaptureError::InvalidTarget("window is minimized".into()))
            }
        }

        fn start(&mut self, sink: FrameSink<CpuSurface>) -> Result<()> {
            self.log.lock().unwrap().push("start");
            self.sink = Some(sink);
            Ok(())
        }

        fn stop(&mut self) {
            self.log.lock().unwrap().push("stop");
            self.sink = None;
        }

        fn release(&mut self) {
            self.log.lock().unwrap().push("release");
        }
    }

    #[test]
    fn test_lifecycle() {
        let (source, log) = ScriptedSource::new(true);
        let session = CaptureSession::new(source, SessionConfig::default()).unwrap();
        assert_eq!(session.state(), SessionState::Created);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(session.start().is_err());

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop();

        assert_eq!(*log.lock().unwrap(), ["validate", "start", "stop", "release"]);
        assert!(matches!(session.start(), Err(CaptureError::SessionStart(_))));
    }

    #[test]
    fn test_invalid_target_fails_start_and_releases() {
        let (source, log) = ScriptedSource::new(false);
        let session = CaptureSession::new(source, SessionConfig::default()).unwrap();

        let result = session.start();
        assert!(matches!(result, Err(CaptureError::SessionStart(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(*log.lock().unwrap(), ["validate", "stop", "release"]);
        assert!(session.target().is_none());
    }

    #[test]
    fn test_drop_releases_without_start() {
        let (source, log) = ScriptedSource::new(true);
        drop(CaptureSession::new(source, SessionConfig::default()).unwrap());
        assert_eq!(*log.lock().unwrap(), ["stop", "release"]);
    }

    #[test]
    fn test_stream_end_moves_to_stopped() {
        let source = SyntheticSource::new(8, 8).end_after(3);
        let session = CaptureSession::new(source, SessionConfig::default()).unwrap();
        session.start().unwrap();

        let reader = session.reader();
        let mut buf = vec![0u8; 8 * 8 * 4];
        let mut ended = false;
        for _ in 0..500 {
            match reader.read_into(&mut buf) {
                Err(CaptureError::SessionEnded) => {
                    ended = true;
                    break;
                }
                _ => thread::sleep(Duration::from_millis(2)),
            }
        }

        assert!(ended);
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop();
    }

    /// Surface that flags use after its device was released.
    struct DeviceBoundSurface {
        entered: Arc<AtomicBool>,
        released: Arc<AtomicBool>,
        misuse: Arc<AtomicUsize>,
        data: Vec<u8>,
    }

    impl Surface for DeviceBoundSurface {
        fn map(&self) -> Result<crate::frame::MappedSurface<'_>> {
            self.entered.store(true, Ordering::SeqCst);
            // Slow map so stop() runs while the read is in flight.
            thread::sleep(Duration::from_millis(100));
            if self.released.load(Ordering::SeqCst) {
                self.misuse.fetch_add(1, Ordering::SeqCst);
            }
            let released = self.released.clone();
            let misuse = self.misuse.clone();
            Ok(crate::frame::MappedSurface::new(&self.data, 4).with_unmap(move || {
                if released.load(Ordering::SeqCst) {
                    misuse.fetch_add(1, Ordering::SeqCst);
                }
            }))
        }
    }

    struct DeviceBoundSource {
        target: CaptureTarget,
        entered: Arc<AtomicBool>,
        released: Arc<AtomicBool>,
        misuse: Arc<AtomicUsize>,
    }

    impl FrameSource for DeviceBoundSource {
        type Surface = DeviceBoundSurface;

        fn target(&self) -> &CaptureTarget {
            &self.target
        }

        fn validate(&self) -> Result<()> {
            Ok(())
        }

        fn start(&mut self, sink: FrameSink<DeviceBoundSurface>) -> Result<()> {
            let surface = DeviceBoundSurface {
                entered: self.entered.clone(),
                released: self.released.clone(),
                misuse: self.misuse.clone(),
                data: vec![7u8; 4],
            };
            sink.push(Frame::new(surface, 1, 1, 4));
            Ok(())
        }

        fn stop(&mut self) {}

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_waits_for_inflight_read() {
        let entered = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        let misuse = Arc::new(AtomicUsize::new(0));
        let source = DeviceBoundSource {
            target: CaptureTarget::new(TargetKind::Window, 1, 1, 1),
            entered: entered.clone(),
            released: released.clone(),
            misuse: misuse.clone(),
        };

        let session = Arc::new(CaptureSession::new(source, SessionConfig::default()).unwrap());
        session.start().unwrap();

        let reader = session.reader();
        let read = thread::spawn(move || {
            let mut buf = [0u8; 4];
            let info = reader.read_into(&mut buf).unwrap();
            (info.width, info.height, buf)
        });

        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        session.stop();
        assert!(released.load(Ordering::SeqCst));

        let (width, height, buf) = read.join().unwrap();
        assert_eq!((width, height), (1, 1));
        assert_eq!(buf, [7u8; 4]);
        assert_eq!(misuse.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_session_queryable_while_stop_waits_for_frame() {
        let source = SyntheticSource::new(4, 4);
        let session = Arc::new(CaptureSession::new(source, SessionConfig::default()).unwrap());
        session.start().unwrap();

        let reader = session.reader();
        let held = loop {
            match reader.latest() {
                Ok(frame) => break frame,
                Err(CaptureError::NoFrame) => thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("unexpected error: {}", e),
            }
        };

        let stopper = {
            let session = session.clone();
            thread::spawn(move || session.stop())
        };

        // The pool closes before stop() starts waiting on the held frame.
        while !session.pool().is_closed() {
            thread::yield_now();
        }
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.target().is_none());
        assert!(!stopper.is_finished());

        drop(held);
        stopper.join().unwrap();
        assert_eq!(session.stats().live, 0);
    }
}
