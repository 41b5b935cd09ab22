use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::frame::{Frame, Surface};

/// How long `wait_idle` waits between complaints about unreleased frames.
const IDLE_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Counts frames that are still alive anywhere, in the pool or held by a
/// reader.
#[derive(Debug, Default)]
struct LiveFrames {
    count: Mutex<usize>,
    released: Condvar,
}

/// Held by every pooled frame; dropping it marks the frame released.
#[derive(Debug)]
pub(crate) struct LiveToken {
    live: Arc<LiveFrames>,
}

impl LiveToken {
    fn acquire(live: &Arc<LiveFrames>) -> Self {
        *lock(&live.count) += 1;
        Self { live: live.clone() }
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        let mut count = lock(&self.live.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.live.released.notify_all();
        }
    }
}

// Poisoning is ignored; no critical section leaves the state half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pushed: u64,
    pub evicted: u64,
    pub buffered: usize,
    pub live: usize,
}

struct PoolInner<S> {
    slots: VecDeque<Arc<Frame<S>>>,
    pushed: u64,
    evicted: u64,
    closed: bool,
}

/// Bounded, latest-wins buffer between the capture callback and readers.
///
/// Never blocks: pulls return `None` when empty, and a push on a full pool
/// evicts the oldest frame. Evicted frames stay valid for readers that still
/// hold them; their surfaces are released when the last reference drops.
pub struct FramePool<S> {
    capacity: usize,
    inner: Mutex<PoolInner<S>>,
    live: Arc<LiveFrames>,
}

impl<S: Surface> FramePool<S> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(PoolInner {
                slots: VecDeque::with_capacity(capacity),
                pushed: 0,
                evicted: 0,
                closed: false,
            }),
            live: Arc::new(LiveFrames::default()),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `frame`, evicting the oldest frame when full. Returns `false`
    /// (and drops the frame) once the pool is closed.
    pub fn push(&self, mut frame: Frame<S>) -> bool {
        let mut evicted = Vec::new();

        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return false;
            }

            inner.pushed += 1;
            frame.sequence = inner.pushed;
            frame.live = Some(LiveToken::acquire(&self.live));

            while inner.slots.len() >= self.capacity {
                if let Some(old) = inner.slots.pop_front() {
                    inner.evicted += 1;
                    evicted.push(old);
                }
            }
            inner.slots.push_back(Arc::new(frame));
        }

        if !evicted.is_empty() {
            debug!("Evicted {} stale frame(s)", evicted.len());
        }
        // Released outside the lock.
        drop(evicted);
        true
    }

    /// Newest frame, left in place.
    pub fn pull_latest(&self) -> Option<Arc<Frame<S>>> {
        lock(&self.inner).slots.back().cloned()
    }

    /// Newest frame, removed together with everything older.
    pub fn pull_latest_and_clear(&self) -> Option<Arc<Frame<S>>> {
        let (latest, older) = {
            let mut inner = lock(&self.inner);
            let latest = inner.slots.pop_back();
            let older: Vec<_> = inner.slots.drain(..).collect();
            (latest, older)
        };
        drop(older);
        latest
    }

    /// Removes the frame with `sequence` and everything older. Newer frames
    /// pushed in the meantime stay.
    pub fn clear_through(&self, sequence: u64) {
        let cleared: Vec<_> = {
            let mut inner = lock(&self.inner);
            let keep_from = inner
                .slots
                .iter()
                .position(|f| f.sequence() > sequence)
                .unwrap_or(inner.slots.len());
            inner.slots.drain(..keep_from).collect()
        };
        drop(cleared);
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames alive anywhere: buffered here or held by readers.
    pub fn live_frames(&self) -> usize {
        *lock(&self.live.count)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Stops accepting frames and releases everything buffered. Idempotent.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.slots.drain(..).collect()
        };

        info!("Frame pool closed, released {} buffered frame(s)", drained.len());
        drop(drained);
    }

    /// Blocks until every frame produced through this pool has been dropped.
    pub fn wait_idle(&self) {
        let mut count = lock(&self.live.count);
        while *count > 0 {
            let (guard, timeout) = self
                .live
                .released
                .wait_timeout(count, IDLE_WARN_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            count = guard;
            if timeout.timed_out() && *count > 0 {
                warn!("Still waiting for {} frame(s) held by readers", *count);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (pushed, evicted, buffered) = {
            let inner = lock(&self.inner);
            (inner.pushed, inner.evicted, inner.slots.len())
        };

        PoolStats {
            pushed,
            evicted,
            buffered,
            live: self.live_frames(),
        }
    }
}
