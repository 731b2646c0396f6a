//! Collaborator traits at the bus-library boundary.
//!
//! The adapter never talks to a concrete bus implementation. It drives a
//! [`BusConnection`] and installs [`MainLoopHooks`], [`ObjectPathHandler`]s and
//! [`MessageFilter`]s on it; the bus calls back through those hooks when it
//! wants descriptors watched, timers armed, or messages delivered.
//!
//! # Contract
//!
//! * Hook methods may be invoked re-entrantly from inside any
//!   [`BusConnection`] method the adapter calls (`handle_watch`,
//!   `handle_timeout`, `dispatch`, …). Implementations of the hooks therefore
//!   never hold their own locks while calling into the connection.
//! * Watch and timeout handles are owned by the bus. A handle stays valid
//!   until the matching `remove_*` hook has been called.

use std::sync::Arc;

use crate::message::Message;
use crate::{
    BusError, BusType, DispatchStatus, HandlerResult, NameFlags, NameReply, TimeoutHandle,
    WatchFlags, WatchHandle,
};

/// Main-loop integration callbacks installed on a connection.
pub trait MainLoopHooks: Send + Sync {
    /// The bus wants `watch` monitored. An error leaves the descriptor
    /// untracked; the bus treats it as an allocation failure.
    fn add_watch(&self, watch: WatchHandle) -> Result<(), BusError>;

    /// The bus revoked `watch`.
    fn remove_watch(&self, watch: WatchHandle);

    /// The bus created `timeout`. It may start enabled or disabled.
    fn add_timeout(&self, timeout: TimeoutHandle) -> Result<(), BusError>;

    /// The bus destroyed `timeout`.
    fn remove_timeout(&self, timeout: TimeoutHandle);

    /// The interval or the enabled state of `timeout` changed.
    fn timeout_toggled(&self, timeout: TimeoutHandle);

    /// The amount of queued inbound data changed.
    fn dispatch_status_changed(&self, status: DispatchStatus);
}

/// Receives method calls addressed to a registered object path.
pub trait ObjectPathHandler: Send + Sync {
    fn handle_message(&self, connection: &dyn BusConnection, message: &Message) -> HandlerResult;
}

/// Sees every inbound message before object-path dispatch.
pub trait MessageFilter: Send + Sync {
    fn filter(&self, connection: &dyn BusConnection, message: &Message) -> HandlerResult;
}

/// An established connection to a message bus.
pub trait BusConnection: Send + Sync {
    /// Install (or clear, with `None`) the main-loop hooks. Installing hooks
    /// makes the bus announce every watch and timeout it already owns.
    fn set_main_loop_hooks(&self, hooks: Option<Arc<dyn MainLoopHooks>>) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;

    /// Unique bus name assigned to this connection, e.g. `":1.42"`.
    fn unique_name(&self) -> Option<String>;

    // ── Watches ─────────────────────────────────────────────────────────────

    fn watch_enabled(&self, watch: WatchHandle) -> bool;

    /// Descriptor behind `watch`, `None` when the watch has none (yet).
    fn watch_fd(&self, watch: WatchHandle) -> Option<i32>;

    /// Interest declared by `watch` (readable and/or writable).
    fn watch_flags(&self, watch: WatchHandle) -> WatchFlags;

    /// Report the conditions observed on the descriptor of `watch`.
    fn handle_watch(&self, watch: WatchHandle, flags: WatchFlags) -> Result<(), BusError>;

    // ── Timeouts ────────────────────────────────────────────────────────────

    /// Interval of `timeout` in milliseconds, `None` for unknown handles.
    fn timeout_interval_ms(&self, timeout: TimeoutHandle) -> Option<u64>;

    fn timeout_enabled(&self, timeout: TimeoutHandle) -> bool;

    /// Tell the bus that `timeout` fired.
    fn handle_timeout(&self, timeout: TimeoutHandle) -> Result<(), BusError>;

    // ── Messages ────────────────────────────────────────────────────────────

    /// Run one dispatch cycle over the inbound queue.
    fn dispatch(&self) -> DispatchStatus;

    /// Queue `message` for sending; returns the serial assigned to it.
    fn send(&self, message: Message) -> Result<u32, BusError>;

    fn register_object_path(
        &self,
        path: &str,
        handler: Arc<dyn ObjectPathHandler>,
    ) -> Result<(), BusError>;

    fn unregister_object_path(&self, path: &str) -> Result<(), BusError>;

    /// Direct child path components registered beneath `path`.
    fn list_registered(&self, path: &str) -> Result<Vec<String>, BusError>;

    fn add_filter(&self, filter: Arc<dyn MessageFilter>) -> Result<(), BusError>;

    /// Remove a filter previously passed to `add_filter`, matched by identity.
    fn remove_filter(&self, filter: &Arc<dyn MessageFilter>) -> Result<(), BusError>;

    fn add_match(&self, rule: &str) -> Result<(), BusError>;

    fn remove_match(&self, rule: &str) -> Result<(), BusError>;

    fn request_name(&self, name: &str, flags: NameFlags) -> Result<NameReply, BusError>;
}

/// Opens connections to one of the well-known buses.
pub trait BusConnector {
    fn open(&self, bus: BusType) -> Result<Arc<dyn BusConnection>, BusError>;
}

/// `true` when `a` and `b` are the same connection object.
pub fn same_connection(a: &dyn BusConnection, b: &dyn BusConnection) -> bool {
    std::ptr::addr_eq(a as *const dyn BusConnection, b as *const dyn BusConnection)
}
