//! [`TimeoutScheduler`] – a time-ordered expiry queue driven by `tick()`.
//!
//! Timers come from two places: the bus library announces its own timeouts
//! through the main-loop hooks ([`TimeoutScheduler::add_bus_timeout`] and
//! friends), and the adapter creates internal timers with a completion
//! callback ([`TimeoutScheduler::add_internal`]), e.g. to drain the inbound
//! queue.
//!
//! Every timer lives in the same list arena. A timer that is linked into the
//! list is enabled; the list is kept sorted ascending by remaining time, so
//! the head is always the next deadline. A disabled timer keeps its arena slot
//! but is not linked.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use pollbus_core::timeout::{ManualClock, TimeoutScheduler};
//! use pollbus_types::BusConnection;
//! use pollbus_types::sim::SimConnection;
//!
//! let clock = Arc::new(ManualClock::new());
//! let scheduler = TimeoutScheduler::with_clock(clock.clone());
//! scheduler.tick(); // first call only records the time reference
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! let on_fire = Arc::new(move |_: &dyn BusConnection| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//! scheduler
//!     .add_internal(SimConnection::new(":1.1"), 25, true, on_fire)
//!     .unwrap();
//!
//! assert_eq!(scheduler.next_deadline_ms(), Some(25));
//! clock.advance_ms(25);
//! assert_eq!(scheduler.tick(), 1);
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! assert_eq!(scheduler.next_deadline_ms(), None);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pollbus_types::connection::same_connection;
use pollbus_types::{BusConnection, BusError, TimeoutHandle};
use tracing::{debug, warn};

use crate::list::{IntrusiveList, ListCore, NodeId};

// ────────────────────────────────────────────────────────────────────────────
// Clocks
// ────────────────────────────────────────────────────────────────────────────

/// Source of monotonic time for the scheduler.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Timers
// ────────────────────────────────────────────────────────────────────────────

/// Completion callback of an internal timer. Receives the connection the
/// timer was created for.
pub type TimerCallback = Arc<dyn Fn(&dyn BusConnection) + Send + Sync>;

/// Handle to a timer owned by a [`TimeoutScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(NodeId);

#[derive(Clone)]
enum TimerKind {
    /// Interval and enabled state are owned by the bus library.
    Bus(TimeoutHandle),
    Internal {
        callback: TimerCallback,
        one_shot: bool,
    },
}

struct Timer {
    connection: Arc<dyn BusConnection>,
    interval_ms: u64,
    remaining_ms: i64,
    kind: TimerKind,
}

/// Ordered expiry queue for bus and internal timers.
pub struct TimeoutScheduler {
    clock: Arc<dyn Clock>,
    timers: IntrusiveList<Timer>,
    // Lock order: `bus_timers` before `timers`.
    bus_timers: Mutex<HashMap<TimeoutHandle, NodeId>>,
    last_tick: Mutex<Option<Instant>>,
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::with_clock(Arc::new(MonotonicClock))
    }
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: IntrusiveList::new(),
            bus_timers: Mutex::new(HashMap::new()),
            last_tick: Mutex::new(None),
        }
    }

    // ── Bus timers ──────────────────────────────────────────────────────────

    /// Track a timeout announced by the bus. It is queued right away if the
    /// bus reports it enabled.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] if the connection does not know
    /// `handle`; [`BusError::OutOfMemory`] if the timer cannot be stored.
    pub fn add_bus_timeout(
        &self,
        handle: TimeoutHandle,
        connection: Arc<dyn BusConnection>,
    ) -> Result<TimerId, BusError> {
        debug!(timeout = handle.0, "add timeout");
        let interval_ms = connection
            .timeout_interval_ms(handle)
            .ok_or_else(|| BusError::InvalidArgument(format!("unknown timeout {}", handle.0)))?;
        let enabled = connection.timeout_enabled(handle);

        let mut index = self.bus_timers.lock();
        let mut core = self.timers.lock();
        if let Some(old) = index.remove(&handle) {
            let _ = core.release(old);
        }
        let id = core.alloc(Timer {
            connection,
            interval_ms,
            remaining_ms: 0,
            kind: TimerKind::Bus(handle),
        })?;
        index.insert(handle, id);
        if enabled {
            enqueue(&mut core, id)?;
        }
        Ok(TimerId(id))
    }

    /// Forget a bus timeout. Returns `false` if it was not tracked.
    pub fn remove_bus_timeout(&self, handle: TimeoutHandle) -> bool {
        debug!(timeout = handle.0, "remove timeout");
        let mut index = self.bus_timers.lock();
        match index.remove(&handle) {
            Some(id) => self.timers.release(id).is_ok(),
            None => false,
        }
    }

    /// The bus changed the interval or the enabled state of `handle`.
    ///
    /// The timer is always taken off the queue first and only re-queued if
    /// the bus reports it enabled, so a notification that did not actually
    /// flip the state can never queue it twice.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] if `handle` is not tracked.
    pub fn bus_timeout_toggled(&self, handle: TimeoutHandle) -> Result<(), BusError> {
        debug!(timeout = handle.0, "timeout toggled");
        let id = self
            .bus_timer(handle)
            .ok_or_else(|| BusError::InvalidArgument(format!("unknown timeout {}", handle.0)))?;
        let connection = self
            .timers
            .with(id.0, |t| t.connection.clone())
            .ok_or(BusError::StaleNode)?;

        // Query the bus without holding our locks.
        let interval = connection.timeout_interval_ms(handle);
        let enabled = connection.timeout_enabled(handle);

        {
            let mut core = self.timers.lock();
            if let (Some(timer), Some(interval)) = (core.get_mut(id.0), interval) {
                timer.interval_ms = interval;
            }
        }
        self.disable(id)?;
        if enabled {
            self.enable(id)?;
        }
        Ok(())
    }

    /// Scheduler handle of the bus timeout `handle`, if tracked.
    pub fn bus_timer(&self, handle: TimeoutHandle) -> Option<TimerId> {
        self.bus_timers.lock().get(&handle).copied().map(TimerId)
    }

    // ── Internal timers ─────────────────────────────────────────────────────

    /// Create and queue an adapter-owned timer. A one-shot timer is freed
    /// after its first firing; a recurring one is re-queued with its full
    /// interval.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] if the timer cannot be stored.
    pub fn add_internal(
        &self,
        connection: Arc<dyn BusConnection>,
        interval_ms: u64,
        one_shot: bool,
        callback: TimerCallback,
    ) -> Result<TimerId, BusError> {
        let mut core = self.timers.lock();
        let id = core.alloc(Timer {
            connection,
            interval_ms,
            remaining_ms: 0,
            kind: TimerKind::Internal { callback, one_shot },
        })?;
        enqueue(&mut core, id)?;
        Ok(TimerId(id))
    }

    /// Free a timer, queued or not.
    ///
    /// # Errors
    ///
    /// [`BusError::StaleNode`] if the timer no longer exists.
    pub fn cancel(&self, id: TimerId) -> Result<(), BusError> {
        let mut index = self.bus_timers.lock();
        self.timers.release(id.0)?;
        index.retain(|_, node| *node != id.0);
        Ok(())
    }

    /// Free every timer created for `connection`. Returns how many went.
    pub fn remove_connection(&self, connection: &dyn BusConnection) -> usize {
        let mut index = self.bus_timers.lock();
        let mut core = self.timers.lock();
        let doomed: Vec<NodeId> = core
            .allocated_ids()
            .into_iter()
            .filter(|id| {
                core.get(*id)
                    .is_some_and(|t| same_connection(t.connection.as_ref(), connection))
            })
            .collect();
        index.retain(|_, node| !doomed.contains(node));
        doomed.into_iter().filter(|id| core.release(*id).is_ok()).count()
    }

    // ── Queue operations ────────────────────────────────────────────────────

    /// Reset the timer to its full interval and (re-)queue it in order.
    ///
    /// # Errors
    ///
    /// [`BusError::StaleNode`] if the timer no longer exists.
    pub fn enable(&self, id: TimerId) -> Result<(), BusError> {
        enqueue(&mut self.timers.lock(), id.0)
    }

    /// Take the timer off the queue. Disabling a disabled timer is a no-op.
    ///
    /// # Errors
    ///
    /// [`BusError::StaleNode`] if the timer no longer exists.
    pub fn disable(&self, id: TimerId) -> Result<(), BusError> {
        let mut core = self.timers.lock();
        if !core.contains(id.0) {
            return Err(BusError::StaleNode);
        }
        if core.is_linked(id.0) {
            core.remove(id.0)?;
        }
        Ok(())
    }

    /// Milliseconds until the earliest queued timer is due, `Some(0)` if it is
    /// already overdue, `None` if nothing is queued.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let core = self.timers.lock();
        core.first()
            .and_then(|id| core.get(id))
            .map(|t| u64::try_from(t.remaining_ms).unwrap_or(0))
    }

    /// Remaining time of a timer, queued or not.
    pub fn remaining_ms(&self, id: TimerId) -> Option<i64> {
        self.timers.with(id.0, |t| t.remaining_ms)
    }

    pub fn is_queued(&self, id: TimerId) -> bool {
        self.timers.is_linked(id.0)
    }

    /// Queued timers with their remaining time, in queue order.
    pub fn snapshot(&self) -> Vec<(TimerId, i64)> {
        self.timers
            .lock()
            .iter()
            .map(|(id, t)| (TimerId(id), t.remaining_ms))
            .collect()
    }

    /// Number of timers that exist, queued or not.
    pub fn len(&self) -> usize {
        self.timers.lock().allocated()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued (enabled) timers.
    pub fn queued(&self) -> usize {
        self.timers.len()
    }

    // ── Clock advance ───────────────────────────────────────────────────────

    /// Advance every queued timer by the time elapsed since the previous call
    /// and fire the ones that became due. Returns how many fired.
    ///
    /// The first call only records the time reference. Elapsed time is
    /// counted in whole milliseconds; the remainder carries over to the next
    /// call.
    pub fn tick(&self) -> usize {
        let Some(elapsed) = self.advance_reference() else {
            debug!("first tick, time reference recorded");
            return 0;
        };

        let expired = {
            let mut core = self.timers.lock();
            let mut expired = Vec::new();
            let mut cursor = core.first();
            while let Some(id) = cursor {
                cursor = core.next(id);
                let Some(timer) = core.get_mut(id) else {
                    continue;
                };
                timer.remaining_ms = timer.remaining_ms.saturating_sub(elapsed);
                if timer.remaining_ms > 0 {
                    continue;
                }
                let due = (id, timer.connection.clone(), timer.kind.clone());
                if core.remove(id).is_ok() {
                    expired.push(due);
                }
            }
            expired
        };

        let fired = expired.len();
        for (id, connection, kind) in expired {
            self.fire(id, connection, kind);
        }
        fired
    }

    fn advance_reference(&self) -> Option<i64> {
        let now = self.clock.now();
        let mut last = self.last_tick.lock();
        let Some(previous) = *last else {
            *last = Some(now);
            return None;
        };
        let elapsed = now.saturating_duration_since(previous);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        *last = Some(previous + Duration::from_millis(ms));
        Some(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    // Runs with no scheduler lock held; bus and callbacks may re-enter.
    fn fire(&self, id: NodeId, connection: Arc<dyn BusConnection>, kind: TimerKind) {
        match kind {
            TimerKind::Bus(handle) => {
                debug!(timeout = handle.0, "timeout handle");
                if let Err(e) = connection.handle_timeout(handle) {
                    warn!(timeout = handle.0, error = %e, "bus rejected timeout");
                }
                let registered = self.bus_timers.lock().get(&handle) == Some(&id);
                if registered
                    && connection.timeout_enabled(handle)
                    && let Err(e) = enqueue(&mut self.timers.lock(), id)
                {
                    debug!(timeout = handle.0, error = %e, "timeout vanished before requeue");
                }
            }
            TimerKind::Internal { callback, one_shot } => {
                callback(connection.as_ref());
                let result = if one_shot {
                    self.timers.release(id).map(drop)
                } else {
                    enqueue(&mut self.timers.lock(), id)
                };
                if result.is_err() {
                    debug!("internal timer cancelled by its own callback");
                }
            }
        }
    }
}

/// Reset `id` to its interval and link it before the first queued timer with
/// strictly more time remaining.
fn enqueue(core: &mut ListCore<Timer>, id: NodeId) -> Result<(), BusError> {
    let timer = core.get_mut(id).ok_or(BusError::StaleNode)?;
    let remaining = i64::try_from(timer.interval_ms).unwrap_or(i64::MAX);
    timer.remaining_ms = remaining;

    if core.is_linked(id) {
        core.remove(id)?;
    }
    let next = core
        .iter()
        .find(|(_, t)| t.remaining_ms > remaining)
        .map(|(next, _)| next);
    match next {
        Some(next) => core.insert_before(id, next),
        None => core.add_tail(id),
    }
}
