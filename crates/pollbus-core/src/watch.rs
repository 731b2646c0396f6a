//! [`WatchRegistry`] – maps bus watches onto a `poll(2)` descriptor set.
//!
//! The bus library announces watches through its main-loop hooks; the
//! registry keeps them in insertion order. Once per loop iteration the host:
//!
//! 1. calls [`WatchRegistry::build_poll_set`] to obtain a [`PollSet`] with one
//!    slot per enabled watch plus any slots it reserved for its own
//!    descriptors,
//! 2. blocks in `poll(2)` on [`PollSet::as_mut_slice`],
//! 3. hands the set back to [`WatchRegistry::process_poll_set`], which
//!    translates the returned events into the bus library's watch vocabulary
//!    and calls [`BusConnection::handle_watch`].
//!
//! A [`PollSet`] is single-use: `process_poll_set` consumes it. Each set is
//! stamped with a build generation, and a watch only trusts its cached slot
//! index when the generations match, so a slot recorded for an older set is
//! never read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pollbus_types::poll_events::{POLLERR, POLLHUP, POLLIN, POLLOUT, POLLPRI, POLLWRBAND};
use pollbus_types::connection::same_connection;
use pollbus_types::{BusConnection, BusError, WatchFlags, WatchHandle};
use tracing::{debug, warn};

use crate::list::IntrusiveList;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// One `struct pollfd` entry, layout-compatible with the C definition.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

impl PollFd {
    /// A slot `poll(2)` ignores (negative descriptor).
    pub const UNUSED: PollFd = PollFd {
        fd: -1,
        events: 0,
        revents: 0,
    };

    pub fn new(fd: i32, events: i16) -> Self {
        Self {
            fd,
            events,
            revents: 0,
        }
    }
}

/// Descriptor array for one poll cycle.
///
/// Layout: `[bus slots][reserved slots][unused slots]`. Bus slots are packed
/// at the front; the reserved slots for the host's own descriptors follow
/// immediately; disabled watches leave unused (`fd == -1`) slots at the end.
#[derive(Debug)]
pub struct PollSet {
    slots: Vec<PollFd>,
    bus_slots: usize,
    reserved: usize,
    generation: u64,
    owner: u64,
}

impl PollSet {
    /// Number of slots filled from bus watches.
    pub fn bus_len(&self) -> usize {
        self.bus_slots
    }

    /// Total number of allocated slots, used or not.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bus_slots(&self) -> &[PollFd] {
        &self.slots[..self.bus_slots]
    }

    /// The slots reserved for the host, directly after the bus slots.
    pub fn reserved_mut(&mut self) -> &mut [PollFd] {
        let start = self.bus_slots;
        &mut self.slots[start..start + self.reserved]
    }

    /// Every allocated slot. Unused slots have a negative descriptor, so the
    /// whole slice can be passed to `poll(2)`.
    pub fn as_slice(&self) -> &[PollFd] {
        &self.slots
    }

    pub fn as_mut_slice(&mut self) -> &mut [PollFd] {
        &mut self.slots
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotRef {
    generation: u64,
    index: usize,
}

struct Watch {
    handle: WatchHandle,
    connection: Arc<dyn BusConnection>,
    slot: Option<SlotRef>,
}

/// Registry of the watches the bus library asked to be monitored.
pub struct WatchRegistry {
    id: u64,
    watches: IntrusiveList<Watch>,
    generation: AtomicU64,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            watches: IntrusiveList::new(),
            generation: AtomicU64::new(0),
        }
    }
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `handle` for `connection`.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] if `handle` is already tracked for this
    /// connection, [`BusError::OutOfMemory`] if the watch cannot be stored;
    /// the descriptor then stays untracked.
    pub fn add_watch(
        &self,
        handle: WatchHandle,
        connection: Arc<dyn BusConnection>,
    ) -> Result<(), BusError> {
        debug!(watch = handle.0, "add watch");
        let mut core = self.watches.lock();
        if core.iter().any(|(_, w)| {
            w.handle == handle && same_connection(w.connection.as_ref(), connection.as_ref())
        }) {
            return Err(BusError::InvalidArgument(format!(
                "watch {} is already tracked",
                handle.0
            )));
        }
        let id = core.alloc(Watch {
            handle,
            connection,
            slot: None,
        })?;
        core.add_tail(id)
    }

    /// Stop tracking `handle`. Returns `false` if it was not tracked.
    pub fn remove_watch(&self, handle: WatchHandle) -> bool {
        debug!(watch = handle.0, "remove watch");
        let mut core = self.watches.lock();
        let found = core
            .iter()
            .find(|(_, w)| w.handle == handle)
            .map(|(id, _)| id);
        match found {
            Some(id) => core.release(id).is_ok(),
            None => false,
        }
    }

    /// Drop every watch that belongs to `connection`.
    pub fn remove_connection(&self, connection: &dyn BusConnection) -> usize {
        let mut core = self.watches.lock();
        let doomed: Vec<_> = core
            .iter()
            .filter(|(_, w)| same_connection(w.connection.as_ref(), connection))
            .map(|(id, _)| id)
            .collect();
        doomed.into_iter().filter(|id| core.release(*id).is_ok()).count()
    }

    /// Number of tracked watches, enabled or not.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Build the descriptor array for the next `poll(2)` call.
    ///
    /// The array is sized for every tracked watch plus `reserve` host slots
    /// up front; disabled watches and watches without a descriptor are skipped
    /// without shrinking it.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] if the array cannot be allocated.
    pub fn build_poll_set(&self, reserve: usize) -> Result<PollSet, BusError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut core = self.watches.lock();

        let total = core.len() + reserve;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(total)
            .map_err(|e| BusError::OutOfMemory(format!("poll set of {total} slots: {e}")))?;
        slots.resize(total, PollFd::UNUSED);

        let mut filled = 0;
        for id in core.ids() {
            let Some(watch) = core.get_mut(id) else {
                continue;
            };
            watch.slot = None;
            if !watch.connection.watch_enabled(watch.handle) {
                continue;
            }
            let Some(fd) = watch.connection.watch_fd(watch.handle).filter(|fd| *fd >= 0) else {
                continue;
            };
            let interest = watch.connection.watch_flags(watch.handle);
            let mut events = 0;
            if interest.contains(WatchFlags::READABLE) {
                events |= POLLIN | POLLPRI;
            }
            if interest.contains(WatchFlags::WRITABLE) {
                events |= POLLOUT | POLLWRBAND;
            }
            slots[filled] = PollFd::new(fd, events);
            watch.slot = Some(SlotRef {
                generation,
                index: filled,
            });
            filled += 1;
        }

        Ok(PollSet {
            slots,
            bus_slots: filled,
            reserved: reserve,
            generation,
            owner: self.id,
        })
    }

    /// Deliver the events `poll(2)` stored in `set` to the bus library.
    ///
    /// Consumes `set`; it is released whether or not anything fired. Returns
    /// the number of watches that were handed to the bus.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] if `set` was built by another registry.
    pub fn process_poll_set(&self, set: PollSet) -> Result<usize, BusError> {
        if set.owner != self.id {
            return Err(BusError::InvalidArgument(
                "poll set was built by a different watch registry".to_string(),
            ));
        }

        // Collect under the lock, deliver after releasing it: the bus may add
        // or remove watches from inside handle_watch.
        let mut ready = Vec::new();
        {
            let mut core = self.watches.lock();
            for id in core.ids() {
                let Some(watch) = core.get_mut(id) else {
                    continue;
                };
                let Some(slot) = watch.slot else {
                    continue;
                };
                if slot.generation != set.generation {
                    continue;
                }
                watch.slot = None;
                let revents = set.slots.get(slot.index).map_or(0, |p| p.revents);
                if revents == 0 {
                    continue;
                }
                if !watch.connection.watch_fd(watch.handle).is_some_and(|fd| fd >= 0) {
                    continue;
                }
                ready.push((watch.handle, watch.connection.clone(), translate(revents)));
            }
        }

        let delivered = ready.len();
        for (handle, connection, flags) in ready {
            debug!(watch = handle.0, flags = flags.bits(), "watch handle");
            if let Err(e) = connection.handle_watch(handle, flags) {
                warn!(watch = handle.0, error = %e, "bus rejected watch event");
            }
        }
        Ok(delivered)
    }
}

/// Translate `poll(2)` result bits into bus watch flags.
fn translate(revents: i16) -> WatchFlags {
    let mut flags = WatchFlags::NONE;
    if revents & POLLERR != 0 {
        flags |= WatchFlags::ERROR;
    }
    if revents & POLLHUP != 0 {
        flags |= WatchFlags::HANGUP;
    }
    if revents & (POLLIN | POLLPRI) != 0 {
        flags |= WatchFlags::READABLE;
    }
    if revents & (POLLOUT | POLLWRBAND) != 0 {
        flags |= WatchFlags::WRITABLE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollbus_types::sim::SimConnection;
    use pollbus_types::{DispatchStatus, MainLoopHooks, TimeoutHandle};

    /// Hooks that forward watch announcements straight into a registry.
    struct Forward {
        registry: Arc<WatchRegistry>,
        connection: std::sync::Weak<SimConnection>,
    }

    impl MainLoopHooks for Forward {
        fn add_watch(&self, watch: WatchHandle) -> Result<(), BusError> {
            let connection = self
                .connection
                .upgrade()
                .ok_or_else(|| BusError::Connection("gone".into()))?;
            self.registry.add_watch(watch, connection)
        }
        fn remove_watch(&self, watch: WatchHandle) {
            self.registry.remove_watch(watch);
        }
        fn add_timeout(&self, _: TimeoutHandle) -> Result<(), BusError> {
            Ok(())
        }
        fn remove_timeout(&self, _: TimeoutHandle) {}
        fn timeout_toggled(&self, _: TimeoutHandle) {}
        fn dispatch_status_changed(&self, _: DispatchStatus) {}
    }

    fn setup() -> (Arc<WatchRegistry>, Arc<SimConnection>) {
        let registry = Arc::new(WatchRegistry::new());
        let bus = SimConnection::new(":1.1");
        let hooks = Arc::new(Forward {
            registry: registry.clone(),
            connection: Arc::downgrade(&bus),
        });
        bus.set_main_loop_hooks(Some(hooks)).unwrap();
        (registry, bus)
    }

    #[test]
    fn build_sizes_for_all_watches_plus_reserve() {
        let (registry, bus) = setup();
        bus.new_watch(Some(5), WatchFlags::READABLE, true).unwrap();
        bus.new_watch(Some(6), WatchFlags::WRITABLE, false).unwrap();
        bus.new_watch(None, WatchFlags::READABLE, true).unwrap();

        let mut set = registry.build_poll_set(2).unwrap();
        assert_eq!(set.capacity(), 5);
        assert_eq!(set.bus_len(), 1);
        assert_eq!(set.bus_slots()[0], PollFd::new(5, POLLIN | POLLPRI));
        assert_eq!(set.reserved_mut().len(), 2);
        assert!(set.as_slice()[1..].iter().all(|p| p.fd == -1));
        registry.process_poll_set(set).unwrap();
    }

    #[test]
    fn interest_flags_map_to_poll_events() {
        let (registry, bus) = setup();
        bus.new_watch(Some(7), WatchFlags::READABLE | WatchFlags::WRITABLE, true)
            .unwrap();
        let set = registry.build_poll_set(0).unwrap();
        assert_eq!(
            set.bus_slots()[0].events,
            POLLIN | POLLPRI | POLLOUT | POLLWRBAND
        );
        registry.process_poll_set(set).unwrap();
    }

    #[test]
    fn process_translates_events_per_watch() {
        let (registry, bus) = setup();
        let a = bus.new_watch(Some(3), WatchFlags::READABLE, true).unwrap();
        let b = bus.new_watch(Some(4), WatchFlags::WRITABLE, true).unwrap();
        let c = bus.new_watch(Some(8), WatchFlags::READABLE, true).unwrap();

        let mut set = registry.build_poll_set(0).unwrap();
        set.as_mut_slice()[0].revents = POLLIN | POLLHUP;
        set.as_mut_slice()[1].revents = POLLOUT | POLLERR;
        // Slot 2 stays quiet.
        assert_eq!(registry.process_poll_set(set).unwrap(), 2);

        let handled = bus.handled_watches();
        assert_eq!(
            handled,
            vec![
                (a, WatchFlags::READABLE | WatchFlags::HANGUP),
                (b, WatchFlags::WRITABLE | WatchFlags::ERROR),
            ]
        );
        assert!(handled.iter().all(|(h, _)| *h != c));
    }

    #[test]
    fn stale_slots_from_an_older_set_are_ignored() {
        let (registry, bus) = setup();
        bus.new_watch(Some(3), WatchFlags::READABLE, true).unwrap();

        let mut old = registry.build_poll_set(0).unwrap();
        old.as_mut_slice()[0].revents = POLLIN;
        let fresh = registry.build_poll_set(0).unwrap();

        // The rebuild re-stamped the watch; the old set no longer matches.
        assert_eq!(registry.process_poll_set(old).unwrap(), 0);
        assert_eq!(registry.process_poll_set(fresh).unwrap(), 0);
        assert!(bus.handled_watches().is_empty());
    }

    #[test]
    fn removal_during_handle_is_tolerated() {
        let (registry, bus) = setup();
        bus.set_drop_watch_on_hangup(true);
        let a = bus.new_watch(Some(3), WatchFlags::READABLE, true).unwrap();
        bus.new_watch(Some(4), WatchFlags::READABLE, true).unwrap();
        assert_eq!(registry.len(), 2);

        let mut set = registry.build_poll_set(0).unwrap();
        set.as_mut_slice()[0].revents = POLLHUP;
        set.as_mut_slice()[1].revents = POLLIN;
        assert_eq!(registry.process_poll_set(set).unwrap(), 2);

        assert_eq!(registry.len(), 1);
        assert_eq!(bus.handled_watches()[0], (a, WatchFlags::HANGUP));
    }

    #[test]
    fn empty_registry_builds_reserve_only_set() {
        let registry = WatchRegistry::new();
        let mut set = registry.build_poll_set(1).unwrap();
        assert_eq!(set.bus_len(), 0);
        set.reserved_mut()[0] = PollFd::new(0, POLLIN);
        assert_eq!(set.as_slice()[0].fd, 0);
        assert_eq!(registry.process_poll_set(set).unwrap(), 0);
    }

    #[test]
    fn foreign_poll_set_is_rejected() {
        let one = WatchRegistry::new();
        let two = WatchRegistry::new();
        let set = one.build_poll_set(0).unwrap();
        assert!(matches!(
            two.process_poll_set(set),
            Err(BusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn announcing_a_tracked_watch_again_is_rejected() {
        let (registry, bus) = setup();
        let watch = bus.new_watch(Some(5), WatchFlags::READABLE, true).unwrap();
        let connection: Arc<dyn BusConnection> = bus.clone();
        assert!(matches!(
            registry.add_watch(watch, connection),
            Err(BusError::InvalidArgument(_))
        ));
        assert_eq!(registry.len(), 1);

        let set = registry.build_poll_set(0).unwrap();
        assert_eq!(set.bus_len(), 1);
        registry.process_poll_set(set).unwrap();
    }

    #[test]
    fn remove_unknown_watch_reports_false() {
        let (registry, bus) = setup();
        let w = bus.new_watch(Some(3), WatchFlags::READABLE, true).unwrap();
        assert!(registry.remove_watch(w));
        assert!(!registry.remove_watch(w));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_connection_drops_only_its_watches() {
        let (registry, bus) = setup();
        bus.new_watch(Some(3), WatchFlags::READABLE, true).unwrap();
        let other = SimConnection::new(":1.2");
        registry.add_watch(WatchHandle(99), other.clone()).unwrap();

        assert_eq!(registry.remove_connection(&*bus), 1);
        assert_eq!(registry.len(), 1);
    }
}
