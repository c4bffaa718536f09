//! Hierarchical timing wheel with millisecond-scale tick resolution.
//!
//! The wheel gives O(1) scheduling and O(1) amortized tick processing over
//! the full 32-bit tick range. Timers due within the next 256 ticks live in
//! a **near ring** of 256 slots; everything further out lives in one of four
//! coarser **level rings** of 64 slots each, indexed by progressively higher
//! bits of the expiry tick.
//!
//! On every physical tick the current near slot is drained and its callbacks
//! are spawned, then the tick counter advances; whenever the low bits of the
//! counter clear, the matching level slot is **cascaded** back down into
//! finer rings. A node placed in level `i` therefore migrates toward the
//! near ring as time passes and fires exactly on its expiry tick. When the
//! 32-bit counter wraps to zero, level 3 slot 0 is cascaded.
//!
//! ## Dispatch contract
//!
//! Callbacks run *outside* the wheel's lock, each on its own tokio task, so
//! a slow callback never stalls the tick loop. Within one slot callbacks are
//! spawned in insertion order; there is no cancellation handle. A callback
//! scheduled for the past fires at the next tick boundary.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

const NEAR_SHIFT: u32 = 8;
const NEAR_SIZE: usize = 1 << NEAR_SHIFT;
const NEAR_MASK: u32 = (NEAR_SIZE - 1) as u32;
const LEVEL_SHIFT: u32 = 6;
const LEVEL_SIZE: usize = 1 << LEVEL_SHIFT;
const LEVEL_MASK: u32 = (LEVEL_SIZE - 1) as u32;
const LEVEL_COUNT: usize = 4;

/// Default tick resolution.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

type Callback = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Node {
    expire: u32,
    callback: Callback,
}

/// Receipt for a scheduled callback. Carries the absolute expiry tick for
/// observability; scheduled callbacks cannot be cancelled.
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle {
    /// Absolute tick at which the callback fires.
    pub expire_tick: u32,
}

struct WheelState {
    near: [Vec<Node>; NEAR_SIZE],
    levels: [[Vec<Node>; LEVEL_SIZE]; LEVEL_COUNT],
    time: u32,
}

/// The timing wheel. Shared behind an [`std::sync::Arc`]; the internal lock
/// is held only for slot placement and slot swaps, never across dispatch.
pub struct TimerWheel {
    state: Mutex<WheelState>,
    tick: Duration,
    quit: Notify,
}

impl TimerWheel {
    /// Create a wheel with the given tick resolution.
    pub fn new(tick: Duration) -> Self {
        Self::with_start_tick(tick, 0)
    }

    fn with_start_tick(tick: Duration, start: u32) -> Self {
        assert!(!tick.is_zero(), "tick resolution must be non-zero");
        Self {
            state: Mutex::new(WheelState {
                near: std::array::from_fn(|_| Vec::new()),
                levels: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
                time: start,
            }),
            tick,
            quit: Notify::new(),
        }
    }

    /// Schedule `callback` to be spawned once `delay` has elapsed.
    ///
    /// The delay is rounded up to whole ticks; a zero delay fires at the
    /// next tick boundary.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ticks = delay.as_nanos().div_ceil(self.tick.as_nanos()) as u32;
        let mut state = self.lock();
        let expire = state.time.wrapping_add(ticks);
        Self::place(
            &mut state,
            Node {
                expire,
                callback: Box::pin(callback),
            },
        );
        TimerHandle { expire_tick: expire }
    }

    /// Drive the wheel until [`stop`](Self::stop) is called. One physical
    /// tick advances the wheel by one; missed ticks are caught up in a
    /// burst so wheel time tracks wall time.
    pub async fn start(&self) {
        // The first tick is due one resolution from now, not immediately.
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + self.tick, self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => self.update(),
                _ = self.quit.notified() => break,
            }
        }
        trace!("timer wheel stopped");
    }

    /// Terminate the tick loop. Already-due callbacks that were spawned
    /// keep running; everything still in the wheel is dropped with it.
    pub fn stop(&self) {
        self.quit.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WheelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot placement rule. Timers whose expiry shares the bits above the
    /// near mask with the current time go into the near ring; otherwise the
    /// first level whose span covers the distance takes the node.
    fn place(state: &mut WheelState, node: Node) {
        let expire = node.expire;
        let current = state.time;
        if (expire | NEAR_MASK) == (current | NEAR_MASK) {
            state.near[(expire & NEAR_MASK) as usize].push(node);
            return;
        }
        let mut level = 0usize;
        let mut mask = (NEAR_SIZE as u32) << LEVEL_SHIFT;
        while level < LEVEL_COUNT - 1 {
            if (expire | (mask - 1)) == (current | (mask - 1)) {
                break;
            }
            mask = mask.wrapping_shl(LEVEL_SHIFT);
            level += 1;
        }
        let slot = ((expire >> (NEAR_SHIFT + level as u32 * LEVEL_SHIFT)) & LEVEL_MASK) as usize;
        state.levels[level][slot].push(node);
    }

    /// Re-distribute one level slot into finer rings.
    fn cascade(state: &mut WheelState, level: usize, slot: usize) {
        let nodes = std::mem::take(&mut state.levels[level][slot]);
        for node in nodes {
            Self::place(state, node);
        }
    }

    /// Advance the tick counter and cascade whichever level slot comes due.
    fn shift(&self) {
        let mut state = self.lock();
        state.time = state.time.wrapping_add(1);
        let ct = state.time;
        if ct == 0 {
            Self::cascade(&mut state, LEVEL_COUNT - 1, 0);
            return;
        }
        let mut mask = NEAR_SIZE as u32;
        let mut time = ct >> NEAR_SHIFT;
        let mut level = 0usize;
        while ct & (mask - 1) == 0 {
            let slot = (time & LEVEL_MASK) as usize;
            if slot != 0 {
                Self::cascade(&mut state, level, slot);
                break;
            }
            mask = mask.wrapping_shl(LEVEL_SHIFT);
            time >>= LEVEL_SHIFT;
            level += 1;
        }
    }

    /// Drain the current near slot and spawn its callbacks, outside the lock.
    fn dispatch_due(&self) {
        let due = {
            let mut state = self.lock();
            let idx = (state.time & NEAR_MASK) as usize;
            if state.near[idx].is_empty() {
                return;
            }
            std::mem::take(&mut state.near[idx])
        };
        for node in due {
            tokio::spawn(node.callback);
        }
    }

    /// One tick: fire zero-delay timers landed since the last tick, advance,
    /// then fire the new current slot.
    fn update(&self) {
        self.dispatch_due();
        self.shift();
        self.dispatch_due();
    }
}
