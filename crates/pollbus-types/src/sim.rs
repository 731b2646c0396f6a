//! In-process simulated bus for tests and headless hosts.
//!
//! [`SimConnection`] implements [`BusConnection`] without any socket. The
//! test plays the role of the bus library: it creates watches and timeouts
//! (which are announced to the installed [`MainLoopHooks`]), queues inbound
//! messages, and then inspects what the adapter did: which watches were
//! handled with which flags, which timeouts fired, what was sent, which match
//! rules and object paths were registered.
//!
//! # Example
//!
//! ```rust
//! use pollbus_types::sim::SimConnection;
//! use pollbus_types::{BusConnection, Message, Value};
//!
//! let bus = SimConnection::new(":1.7");
//! let serial = bus
//!     .send(Message::signal("/org/example", "org.example.Demo", "Ping").with_arg(Value::UInt32(1)))
//!     .expect("sim send must succeed");
//! assert_eq!(serial, 1);
//! assert_eq!(bus.sent().len(), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::connection::{BusConnection, BusConnector, MainLoopHooks, MessageFilter, ObjectPathHandler};
use crate::message::{Message, MessageKind};
use crate::{
    BusError, BusType, DispatchStatus, HandlerResult, NameFlags, NameReply, TimeoutHandle,
    WatchFlags, WatchHandle,
};

#[derive(Debug, Clone, Copy)]
struct SimWatch {
    fd: Option<i32>,
    flags: WatchFlags,
    enabled: bool,
}

#[derive(Debug, Clone, Copy)]
struct SimTimeout {
    interval_ms: u64,
    enabled: bool,
}

#[derive(Default)]
struct SimState {
    connected: bool,
    hooks: Option<Arc<dyn MainLoopHooks>>,
    next_handle: u64,
    next_serial: u32,
    watches: BTreeMap<WatchHandle, SimWatch>,
    timeouts: BTreeMap<TimeoutHandle, SimTimeout>,
    handled_watches: Vec<(WatchHandle, WatchFlags)>,
    fired_timeouts: Vec<TimeoutHandle>,
    drop_watch_on_hangup: bool,
    inbound: VecDeque<Message>,
    sent: Vec<Message>,
    objects: BTreeMap<String, Arc<dyn ObjectPathHandler>>,
    filters: Vec<Arc<dyn MessageFilter>>,
    match_rules: Vec<String>,
    owned_names: BTreeSet<String>,
    foreign_names: BTreeSet<String>,
    dispatch_cycles: usize,
}

/// A simulated bus connection. Construct with [`SimConnection::new`].
pub struct SimConnection {
    unique_name: String,
    state: Mutex<SimState>,
}

impl SimConnection {
    /// Create a connected simulated bus whose unique name is `unique_name`.
    pub fn new(unique_name: &str) -> Arc<Self> {
        Arc::new(Self {
            unique_name: unique_name.to_string(),
            state: Mutex::new(SimState {
                connected: true,
                ..SimState::default()
            }),
        })
    }

    fn hooks(&self) -> Option<Arc<dyn MainLoopHooks>> {
        self.state.lock().hooks.clone()
    }

    fn allocate_handle(state: &mut SimState) -> u64 {
        state.next_handle += 1;
        state.next_handle
    }

    // ────────────────────────────────────────────────────────────────────────
    // Bus-side simulation
    // ────────────────────────────────────────────────────────────────────────

    /// Create a watch on `fd` and announce it to the installed hooks.
    ///
    /// # Errors
    ///
    /// Propagates the hook's refusal; the watch is discarded in that case.
    pub fn new_watch(
        &self,
        fd: Option<i32>,
        flags: WatchFlags,
        enabled: bool,
    ) -> Result<WatchHandle, BusError> {
        let handle = {
            let mut state = self.state.lock();
            let handle = WatchHandle(Self::allocate_handle(&mut state));
            state.watches.insert(handle, SimWatch { fd, flags, enabled });
            handle
        };
        if let Some(hooks) = self.hooks()
            && let Err(e) = hooks.add_watch(handle)
        {
            self.state.lock().watches.remove(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn set_watch_enabled(&self, watch: WatchHandle, enabled: bool) {
        if let Some(w) = self.state.lock().watches.get_mut(&watch) {
            w.enabled = enabled;
        }
    }

    /// Revoke `watch`, telling the hooks first.
    pub fn drop_watch(&self, watch: WatchHandle) {
        if let Some(hooks) = self.hooks() {
            hooks.remove_watch(watch);
        }
        self.state.lock().watches.remove(&watch);
    }

    /// When set, a watch reported with [`WatchFlags::HANGUP`] is revoked from
    /// inside `handle_watch`, the way a real bus drops a dead socket.
    pub fn set_drop_watch_on_hangup(&self, drop: bool) {
        self.state.lock().drop_watch_on_hangup = drop;
    }

    /// Create a timeout and announce it to the installed hooks.
    ///
    /// # Errors
    ///
    /// Propagates the hook's refusal; the timeout is discarded in that case.
    pub fn new_timeout(&self, interval_ms: u64, enabled: bool) -> Result<TimeoutHandle, BusError> {
        let handle = {
            let mut state = self.state.lock();
            let handle = TimeoutHandle(Self::allocate_handle(&mut state));
            state.timeouts.insert(handle, SimTimeout { interval_ms, enabled });
            handle
        };
        if let Some(hooks) = self.hooks()
            && let Err(e) = hooks.add_timeout(handle)
        {
            self.state.lock().timeouts.remove(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Change the interval and/or enabled state of `timeout`, then notify the
    /// hooks.
    pub fn toggle_timeout(&self, timeout: TimeoutHandle, enabled: bool, interval_ms: u64) {
        {
            let mut state = self.state.lock();
            match state.timeouts.get_mut(&timeout) {
                Some(t) => {
                    t.enabled = enabled;
                    t.interval_ms = interval_ms;
                }
                None => return,
            }
        }
        if let Some(hooks) = self.hooks() {
            hooks.timeout_toggled(timeout);
        }
    }

    /// Destroy `timeout`, telling the hooks first.
    pub fn drop_timeout(&self, timeout: TimeoutHandle) {
        if let Some(hooks) = self.hooks() {
            hooks.remove_timeout(timeout);
        }
        self.state.lock().timeouts.remove(&timeout);
    }

    /// Queue an inbound message and report that data remains.
    pub fn push_inbound(&self, mut message: Message) {
        {
            let mut state = self.state.lock();
            if message.serial == 0 {
                state.next_serial += 1;
                message.serial = state.next_serial;
            }
            state.inbound.push_back(message);
        }
        if let Some(hooks) = self.hooks() {
            hooks.dispatch_status_changed(DispatchStatus::DataRemains);
        }
    }

    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Pretend another peer already owns `name`.
    pub fn mark_name_taken(&self, name: &str) {
        self.state.lock().foreign_names.insert(name.to_string());
    }

    // ────────────────────────────────────────────────────────────────────────
    // Inspection
    // ────────────────────────────────────────────────────────────────────────

    pub fn sent(&self) -> Vec<Message> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn handled_watches(&self) -> Vec<(WatchHandle, WatchFlags)> {
        self.state.lock().handled_watches.clone()
    }

    pub fn fired_timeouts(&self) -> Vec<TimeoutHandle> {
        self.state.lock().fired_timeouts.clone()
    }

    pub fn match_rules(&self) -> Vec<String> {
        self.state.lock().match_rules.clone()
    }

    pub fn registered_paths(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    pub fn owned_names(&self) -> Vec<String> {
        self.state.lock().owned_names.iter().cloned().collect()
    }

    pub fn pending_inbound(&self) -> usize {
        self.state.lock().inbound.len()
    }

    pub fn dispatch_cycles(&self) -> usize {
        self.state.lock().dispatch_cycles
    }

    pub fn has_hooks(&self) -> bool {
        self.state.lock().hooks.is_some()
    }
}

impl BusConnection for SimConnection {
    fn set_main_loop_hooks(&self, hooks: Option<Arc<dyn MainLoopHooks>>) -> Result<(), BusError> {
        let (watches, timeouts) = {
            let mut state = self.state.lock();
            state.hooks = hooks.clone();
            (
                state.watches.keys().copied().collect::<Vec<_>>(),
                state.timeouts.keys().copied().collect::<Vec<_>>(),
            )
        };
        if let Some(hooks) = hooks {
            for watch in watches {
                hooks.add_watch(watch)?;
            }
            for timeout in timeouts {
                hooks.add_timeout(timeout)?;
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn unique_name(&self) -> Option<String> {
        Some(self.unique_name.clone())
    }

    fn watch_enabled(&self, watch: WatchHandle) -> bool {
        self.state.lock().watches.get(&watch).is_some_and(|w| w.enabled)
    }

    fn watch_fd(&self, watch: WatchHandle) -> Option<i32> {
        self.state.lock().watches.get(&watch).and_then(|w| w.fd)
    }

    fn watch_flags(&self, watch: WatchHandle) -> WatchFlags {
        self.state
            .lock()
            .watches
            .get(&watch)
            .map_or(WatchFlags::NONE, |w| w.flags)
    }

    fn handle_watch(&self, watch: WatchHandle, flags: WatchFlags) -> Result<(), BusError> {
        let drop_it = {
            let mut state = self.state.lock();
            if !state.watches.contains_key(&watch) {
                return Err(BusError::InvalidArgument(format!("unknown watch {}", watch.0)));
            }
            state.handled_watches.push((watch, flags));
            state.drop_watch_on_hangup && flags.contains(WatchFlags::HANGUP)
        };
        if drop_it {
            debug!(watch = watch.0, "sim bus dropping hung-up watch");
            self.drop_watch(watch);
        }
        Ok(())
    }

    fn timeout_interval_ms(&self, timeout: TimeoutHandle) -> Option<u64> {
        self.state.lock().timeouts.get(&timeout).map(|t| t.interval_ms)
    }

    fn timeout_enabled(&self, timeout: TimeoutHandle) -> bool {
        self.state.lock().timeouts.get(&timeout).is_some_and(|t| t.enabled)
    }

    fn handle_timeout(&self, timeout: TimeoutHandle) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if !state.timeouts.contains_key(&timeout) {
            return Err(BusError::InvalidArgument(format!("unknown timeout {}", timeout.0)));
        }
        state.fired_timeouts.push(timeout);
        Ok(())
    }

    fn dispatch(&self) -> DispatchStatus {
        let (message, filters, object) = {
            let mut state = self.state.lock();
            state.dispatch_cycles += 1;
            let Some(message) = state.inbound.pop_front() else {
                return DispatchStatus::Complete;
            };
            let object = match (message.kind, message.path.as_deref()) {
                (MessageKind::MethodCall, Some(path)) => state.objects.get(path).cloned(),
                _ => None,
            };
            (message, state.filters.clone(), object)
        };

        let mut result = HandlerResult::NotYetHandled;
        for filter in &filters {
            result = filter.filter(self, &message);
            if result == HandlerResult::Handled {
                break;
            }
        }
        if result == HandlerResult::NotYetHandled
            && let Some(object) = object
        {
            object.handle_message(self, &message);
        }

        if self.state.lock().inbound.is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }

    fn send(&self, mut message: Message) -> Result<u32, BusError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BusError::Connection("sim bus is disconnected".to_string()));
        }
        state.next_serial += 1;
        message.serial = state.next_serial;
        message.sender = Some(self.unique_name.clone());
        state.sent.push(message);
        Ok(state.next_serial)
    }

    fn register_object_path(
        &self,
        path: &str,
        handler: Arc<dyn ObjectPathHandler>,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.objects.contains_key(path) {
            return Err(BusError::ObjectPath {
                path: path.to_string(),
                details: "already registered".to_string(),
            });
        }
        state.objects.insert(path.to_string(), handler);
        Ok(())
    }

    fn unregister_object_path(&self, path: &str) -> Result<(), BusError> {
        match self.state.lock().objects.remove(path) {
            Some(_) => Ok(()),
            None => Err(BusError::ObjectPath {
                path: path.to_string(),
                details: "not registered".to_string(),
            }),
        }
    }

    fn list_registered(&self, path: &str) -> Result<Vec<String>, BusError> {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        let state = self.state.lock();
        let children: BTreeSet<String> = state
            .objects
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|child| !child.is_empty())
            .map(str::to_string)
            .collect();
        Ok(children.into_iter().collect())
    }

    fn add_filter(&self, filter: Arc<dyn MessageFilter>) -> Result<(), BusError> {
        self.state.lock().filters.push(filter);
        Ok(())
    }

    fn remove_filter(&self, filter: &Arc<dyn MessageFilter>) -> Result<(), BusError> {
        let mut state = self.state.lock();
        match state.filters.iter().position(|f| Arc::ptr_eq(f, filter)) {
            Some(idx) => {
                state.filters.remove(idx);
                Ok(())
            }
            None => Err(BusError::InvalidArgument("filter is not installed".to_string())),
        }
    }

    fn add_match(&self, rule: &str) -> Result<(), BusError> {
        if !rule.starts_with("type=") {
            return Err(BusError::MatchRule {
                rule: rule.to_string(),
                details: "rule must start with a type clause".to_string(),
            });
        }
        self.state.lock().match_rules.push(rule.to_string());
        Ok(())
    }

    fn remove_match(&self, rule: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        match state.match_rules.iter().position(|r| r == rule) {
            Some(idx) => {
                state.match_rules.remove(idx);
                Ok(())
            }
            None => Err(BusError::MatchRule {
                rule: rule.to_string(),
                details: "no such rule".to_string(),
            }),
        }
    }

    fn request_name(&self, name: &str, flags: NameFlags) -> Result<NameReply, BusError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BusError::Connection("sim bus is disconnected".to_string()));
        }
        if state.owned_names.contains(name) {
            return Ok(NameReply::AlreadyOwner);
        }
        if state.foreign_names.contains(name) {
            if !flags.replace_existing {
                return Ok(if flags.do_not_queue {
                    NameReply::Exists
                } else {
                    NameReply::InQueue
                });
            }
            state.foreign_names.remove(name);
        }
        state.owned_names.insert(name.to_string());
        Ok(NameReply::PrimaryOwner)
    }
}

/// A [`BusConnector`] that hands out one pre-built [`SimConnection`] per bus.
pub struct SimConnector {
    session: Arc<SimConnection>,
    system: Arc<SimConnection>,
}

impl SimConnector {
    pub fn new(session: Arc<SimConnection>, system: Arc<SimConnection>) -> Self {
        Self { session, system }
    }
}

impl BusConnector for SimConnector {
    fn open(&self, bus: BusType) -> Result<Arc<dyn BusConnection>, BusError> {
        let connection = match bus {
            BusType::Session => self.session.clone(),
            BusType::System => self.system.clone(),
        };
        if !connection.is_connected() {
            return Err(BusError::Connection(format!("{bus} bus is not reachable")));
        }
        Ok(connection)
    }
}
