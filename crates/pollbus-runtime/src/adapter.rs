//! [`Adapter`] – drives bus connections from a single `poll(2)` loop.
//!
//! The adapter owns the watch registry, the timeout scheduler and the signal
//! registry. Attaching a connection installs main-loop hooks that feed those
//! registries, a message filter that routes subscribed signals, and a
//! periodic drain timer. The host loop then looks like this:
//!
//! ```rust,ignore
//! loop {
//!     let mut set = adapter.build_poll_set()?;
//!     let timeout = adapter.next_deadline_ms().map_or(-1, |ms| ms as i32);
//!     poll(set.as_mut_slice(), timeout);
//!     adapter.process_poll_set(set)?;
//!     adapter.tick();
//! }
//! ```
//!
//! Connections keep only weak references back to the adapter's registries,
//! so dropping the adapter never leaks through a connection.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pollbus_core::timeout::{Clock, MonotonicClock, TimeoutScheduler};
use pollbus_core::watch::{PollSet, WatchRegistry};
use pollbus_dispatch::object::ObjectDispatcher;
use pollbus_dispatch::signals::SignalRegistry;
use pollbus_dispatch::table::{Binding, Dispatch};
use pollbus_types::{
    BusConnection, BusConnector, BusError, BusType, DispatchStatus, MainLoopHooks, Message,
    MessageFilter, NameFlags, NameReply, TimeoutHandle, Value, WatchHandle,
};
use pollbus_types::connection::same_connection;
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;

struct Registries {
    watches: WatchRegistry,
    timeouts: TimeoutScheduler,
    signals: Arc<SignalRegistry>,
}

// A connection this adapter has installed itself on.
struct Attachment {
    connection: Weak<dyn BusConnection>,
    filter: Arc<dyn MessageFilter>,
}

impl Attachment {
    fn is(&self, connection: &dyn BusConnection) -> bool {
        self.connection
            .upgrade()
            .is_some_and(|c| same_connection(c.as_ref(), connection))
    }
}

/// Poll-loop adapter for one or more bus connections.
pub struct Adapter {
    config: AdapterConfig,
    registries: Arc<Registries>,
    attached: Mutex<Vec<Attachment>>,
}

impl Adapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    /// An adapter whose timers run on `clock`.
    pub fn with_clock(config: AdapterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            registries: Arc::new(Registries {
                watches: WatchRegistry::new(),
                timeouts: TimeoutScheduler::with_clock(clock),
                signals: Arc::new(SignalRegistry::new()),
            }),
            attached: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn watches(&self) -> &WatchRegistry {
        &self.registries.watches
    }

    pub fn timeouts(&self) -> &TimeoutScheduler {
        &self.registries.timeouts
    }

    pub fn signals(&self) -> &SignalRegistry {
        &self.registries.signals
    }

    // ── Connections ─────────────────────────────────────────────────────────

    /// Open a connection to `bus` and attach it.
    ///
    /// The scheduler is ticked first so the time reference exists before any
    /// timer is armed.
    ///
    /// # Errors
    ///
    /// The connector's error, or any error from [`Adapter::attach`].
    pub fn get_connection(
        &self,
        connector: &dyn BusConnector,
        bus: BusType,
    ) -> Result<Arc<dyn BusConnection>, BusError> {
        self.tick();
        let connection = connector.open(bus)?;
        self.attach(connection.clone())?;
        let unique_name = connection.unique_name().unwrap_or_default();
        info!(bus = %bus, unique_name = %unique_name, "connected");
        Ok(connection)
    }

    /// Connect to the configured bus and request the configured name, if any.
    ///
    /// # Errors
    ///
    /// See [`Adapter::get_connection`] and [`Adapter::request_name`].
    pub fn connect(&self, connector: &dyn BusConnector) -> Result<Arc<dyn BusConnection>, BusError> {
        let connection = self.get_connection(connector, self.config.bus)?;
        if let Some(name) = &self.config.name {
            self.request_name(connection.as_ref(), name, self.config.replace_existing)?;
        }
        Ok(connection)
    }

    /// Install the main-loop hooks, the signal filter and the periodic drain
    /// timer on an already open connection. A `drain_interval_ms` of zero
    /// leaves the periodic drain off; drains still happen whenever the bus
    /// reports queued data.
    ///
    /// Attaching a connection that is already attached does nothing.
    ///
    /// # Errors
    ///
    /// Whatever the connection refuses. Partial setup is undone.
    pub fn attach(&self, connection: Arc<dyn BusConnection>) -> Result<(), BusError> {
        let mut attached = self.attached.lock();
        attached.retain(|a| a.connection.strong_count() > 0);
        if attached.iter().any(|a| a.is(connection.as_ref())) {
            debug!("connection already attached");
            return Ok(());
        }
        let result = self.install(&mut attached, connection.clone());
        drop(attached);
        if result.is_err() {
            self.detach(&connection);
        }
        result
    }

    /// Whether `connection` is currently attached to this adapter.
    pub fn is_attached(&self, connection: &dyn BusConnection) -> bool {
        self.attached.lock().iter().any(|a| a.is(connection))
    }

    fn install(
        &self,
        attached: &mut Vec<Attachment>,
        connection: Arc<dyn BusConnection>,
    ) -> Result<(), BusError> {
        let hooks: Arc<dyn MainLoopHooks> = Arc::new(ConnectionHooks {
            registries: Arc::downgrade(&self.registries),
            connection: Arc::downgrade(&connection),
        });
        connection.set_main_loop_hooks(Some(hooks))?;
        let filter: Arc<dyn MessageFilter> = self.registries.signals.filter();
        connection.add_filter(filter.clone())?;
        attached.push(Attachment {
            connection: Arc::downgrade(&connection),
            filter,
        });
        if self.config.drain_interval_ms > 0 {
            self.registries.timeouts.add_internal(
                connection,
                self.config.drain_interval_ms,
                false,
                Arc::new(drain),
            )?;
        }
        Ok(())
    }

    /// Remove the hooks and the signal filter from `connection` and forget
    /// its watches, timers and signal subscriptions.
    pub fn detach(&self, connection: &Arc<dyn BusConnection>) {
        let attachment = {
            let mut attached = self.attached.lock();
            attached
                .iter()
                .position(|a| a.is(connection.as_ref()))
                .map(|idx| attached.swap_remove(idx))
        };
        if let Some(attachment) = attachment
            && let Err(e) = connection.remove_filter(&attachment.filter)
        {
            warn!(error = %e, "could not remove signal filter");
        }
        if let Err(e) = connection.set_main_loop_hooks(None) {
            warn!(error = %e, "could not clear main-loop hooks");
        }
        let watches = self.registries.watches.remove_connection(connection.as_ref());
        let timers = self.registries.timeouts.remove_connection(connection.as_ref());
        let subscriptions = self.registries.signals.remove_connection(connection.as_ref());
        debug!(watches, timers, subscriptions, "connection detached");
    }

    /// Request the well-known `name` without queueing.
    ///
    /// Replacement by others is always allowed; `replace` additionally takes
    /// the name over from a current owner that allows it.
    ///
    /// # Errors
    ///
    /// [`BusError::NameUnavailable`] when another owner keeps the name,
    /// [`BusError::NameRequest`] when the bus call itself fails.
    pub fn request_name(
        &self,
        connection: &dyn BusConnection,
        name: &str,
        replace: bool,
    ) -> Result<NameReply, BusError> {
        let flags = NameFlags {
            allow_replacement: true,
            replace_existing: replace,
            do_not_queue: true,
        };
        let reply = connection
            .request_name(name, flags)
            .map_err(|e| BusError::NameRequest {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        match reply {
            NameReply::Exists => Err(BusError::NameUnavailable(name.to_string())),
            reply => {
                info!(name, ?reply, "name acquired");
                Ok(reply)
            }
        }
    }

    // ── Loop ────────────────────────────────────────────────────────────────

    /// Descriptor set for the next `poll(2)` call, with the configured number
    /// of reserved host slots.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] if the set cannot be allocated.
    pub fn build_poll_set(&self) -> Result<PollSet, BusError> {
        self.registries.watches.build_poll_set(self.config.reserve_slots)
    }

    /// Hand the result of `poll(2)` back to the bus. Returns how many watches
    /// had events.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] if `set` came from another adapter.
    pub fn process_poll_set(&self, set: PollSet) -> Result<usize, BusError> {
        self.registries.watches.process_poll_set(set)
    }

    /// Milliseconds until the next timer is due, `None` if none is queued.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.registries.timeouts.next_deadline_ms()
    }

    /// Advance the timers. Returns how many fired.
    pub fn tick(&self) -> usize {
        self.registries.timeouts.tick()
    }

    // ── Objects and signals ─────────────────────────────────────────────────

    /// Serve `binding` at `path` on `connection`.
    ///
    /// # Errors
    ///
    /// The connection's refusal, e.g. when the path is taken.
    pub fn register_object<T: Send + Sync + 'static>(
        &self,
        connection: &dyn BusConnection,
        path: &str,
        binding: Binding<T>,
    ) -> Result<(), BusError> {
        debug!(path, "register object");
        connection.register_object_path(path, Arc::new(ObjectDispatcher::new(binding)))
    }

    /// # Errors
    ///
    /// The connection's refusal, e.g. when nothing is registered at `path`.
    pub fn unregister_object(&self, connection: &dyn BusConnection, path: &str) -> Result<(), BusError> {
        debug!(path, "unregister object");
        connection.unregister_object_path(path)
    }

    /// Receive the signals of `target`'s interfaces, optionally only from
    /// `sender` and/or for `path`.
    ///
    /// # Errors
    ///
    /// The bus's refusal of the match rule.
    pub fn subscribe_signals(
        &self,
        connection: Arc<dyn BusConnection>,
        sender: Option<&str>,
        path: Option<&str>,
        target: Arc<dyn Dispatch>,
    ) -> Result<(), BusError> {
        self.registries
            .signals
            .subscribe(connection, sender, path, Some(target))
    }

    /// # Errors
    ///
    /// [`BusError::SubscriptionNotFound`] if no subscription has exactly these
    /// keys.
    pub fn unsubscribe_signals(
        &self,
        connection: &dyn BusConnection,
        sender: Option<&str>,
        path: Option<&str>,
    ) -> Result<(), BusError> {
        self.registries.signals.unsubscribe(connection, sender, path)
    }
}

/// Build and send a signal. Returns the serial the bus assigned.
///
/// # Errors
///
/// The connection's send error.
pub fn emit_signal(
    connection: &dyn BusConnection,
    path: &str,
    interface: &str,
    member: &str,
    args: impl IntoIterator<Item = Value>,
) -> Result<u32, BusError> {
    let mut message = Message::signal(path, interface, member);
    message.args.extend(args);
    debug!(path, interface, member, "emit signal");
    connection.send(message)
}

// Timer callback: dispatch until the bus has nothing left queued.
fn drain(connection: &dyn BusConnection) {
    if !connection.is_connected() {
        return;
    }
    let mut cycles = 1;
    while connection.dispatch() == DispatchStatus::DataRemains {
        cycles += 1;
    }
    debug!(cycles, "connection dispatch");
}

// ────────────────────────────────────────────────────────────────────────────
// Hooks installed on each connection
// ────────────────────────────────────────────────────────────────────────────

struct ConnectionHooks {
    registries: Weak<Registries>,
    connection: Weak<dyn BusConnection>,
}

impl ConnectionHooks {
    fn upgrade(&self) -> Result<(Arc<Registries>, Arc<dyn BusConnection>), BusError> {
        let registries = self
            .registries
            .upgrade()
            .ok_or_else(|| BusError::Connection("adapter has been dropped".to_string()))?;
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| BusError::Connection("connection has been dropped".to_string()))?;
        Ok((registries, connection))
    }
}

impl MainLoopHooks for ConnectionHooks {
    fn add_watch(&self, watch: WatchHandle) -> Result<(), BusError> {
        let (registries, connection) = self.upgrade()?;
        registries.watches.add_watch(watch, connection)
    }

    fn remove_watch(&self, watch: WatchHandle) {
        if let Some(registries) = self.registries.upgrade() {
            registries.watches.remove_watch(watch);
        }
    }

    fn add_timeout(&self, timeout: TimeoutHandle) -> Result<(), BusError> {
        let (registries, connection) = self.upgrade()?;
        registries.timeouts.add_bus_timeout(timeout, connection).map(drop)
    }

    fn remove_timeout(&self, timeout: TimeoutHandle) {
        if let Some(registries) = self.registries.upgrade() {
            registries.timeouts.remove_bus_timeout(timeout);
        }
    }

    fn timeout_toggled(&self, timeout: TimeoutHandle) {
        if let Some(registries) = self.registries.upgrade()
            && let Err(e) = registries.timeouts.bus_timeout_toggled(timeout)
        {
            warn!(timeout = timeout.0, error = %e, "toggle for untracked timeout");
        }
    }

    fn dispatch_status_changed(&self, status: DispatchStatus) {
        if status != DispatchStatus::DataRemains {
            return;
        }
        let Ok((registries, connection)) = self.upgrade() else {
            return;
        };
        if !connection.is_connected() {
            return;
        }
        if let Err(e) = registries
            .timeouts
            .add_internal(connection, 0, true, Arc::new(drain))
        {
            warn!(error = %e, "could not queue dispatch drain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pollbus_core::timeout::ManualClock;
    use pollbus_dispatch::table::{ArgSpec, DispatchTable};
    use pollbus_types::poll_events::POLLIN;
    use pollbus_types::sim::{SimConnection, SimConnector};
    use pollbus_types::{HandlerResult, MessageKind, WatchFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        adapter: Adapter,
        clock: Arc<ManualClock>,
        sim: Arc<SimConnection>,
        connection: Arc<dyn BusConnection>,
    }

    fn harness(config: AdapterConfig) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let adapter = Adapter::with_clock(config, clock.clone());
        let sim = SimConnection::new(":1.10");
        let connector = SimConnector::new(sim.clone(), SimConnection::new(":1.20"));
        let connection = adapter
            .get_connection(&connector, BusType::Session)
            .expect("connect");
        Harness {
            adapter,
            clock,
            sim,
            connection,
        }
    }

    #[derive(Default)]
    struct Calculator {
        calls: Mutex<Vec<String>>,
    }

    fn calculator() -> Binding<Calculator> {
        let table = DispatchTable::<Calculator>::builder()
            .interface("org.example.Calculator", |i| {
                i.method(
                    "Add",
                    [
                        ArgSpec::input("a", "i"),
                        ArgSpec::input("b", "i"),
                        ArgSpec::output("sum", "i"),
                    ],
                    |bus, msg, calc: &Calculator| {
                        let sum = msg
                            .args
                            .iter()
                            .map(|v| match v {
                                Value::Int32(n) => *n,
                                _ => 0,
                            })
                            .sum::<i32>();
                        calc.calls.lock().push(format!("Add={sum}"));
                        bus.send(Message::method_return(msg).with_arg(Value::Int32(sum)))?;
                        Ok(())
                    },
                )
                .signal("Overflow", [])
            })
            .interface("org.example.Display", |i| {
                i.signal_handler("Refresh", [], |_, msg, calc: &Calculator| {
                    let sender = msg.sender.clone().unwrap_or_default();
                    calc.calls.lock().push(format!("Refresh from {sender}"));
                    Ok(())
                })
            })
            .build();
        Binding::new(Arc::new(table), Arc::new(Calculator::default()))
    }

    #[test]
    fn connecting_installs_hooks_filter_and_drain() {
        let h = harness(AdapterConfig::default());
        assert!(h.sim.has_hooks());
        assert_eq!(h.adapter.timeouts().len(), 1);
        assert_eq!(h.adapter.next_deadline_ms(), Some(100));
    }

    #[test]
    fn zero_drain_interval_disables_periodic_drain() {
        let h = harness(AdapterConfig {
            drain_interval_ms: 0,
            ..AdapterConfig::default()
        });
        assert!(h.adapter.timeouts().is_empty());
        assert_eq!(h.adapter.next_deadline_ms(), None);
    }

    #[test]
    fn existing_watches_are_announced_on_attach() {
        let clock = Arc::new(ManualClock::new());
        let adapter = Adapter::with_clock(AdapterConfig::default(), clock);
        let sim = SimConnection::new(":1.10");
        sim.new_watch(Some(7), WatchFlags::READABLE, true).unwrap();
        adapter.attach(sim.clone()).unwrap();
        assert_eq!(adapter.watches().len(), 1);
    }

    #[test]
    fn watch_events_reach_the_bus() {
        let h = harness(AdapterConfig {
            reserve_slots: 1,
            ..AdapterConfig::default()
        });
        let watch = h.sim.new_watch(Some(5), WatchFlags::READABLE, true).unwrap();

        let mut set = h.adapter.build_poll_set().unwrap();
        assert_eq!(set.capacity(), 2);
        assert_eq!(set.reserved_mut().len(), 1);
        set.as_mut_slice()[0].revents = POLLIN;
        assert_eq!(h.adapter.process_poll_set(set).unwrap(), 1);
        assert_eq!(h.sim.handled_watches(), vec![(watch, WatchFlags::READABLE)]);

        h.sim.drop_watch(watch);
        assert!(h.adapter.watches().is_empty());
    }

    #[test]
    fn bus_timeouts_fire_through_tick() {
        let h = harness(AdapterConfig::default());
        let timeout = h.sim.new_timeout(30, true).unwrap();
        assert_eq!(h.adapter.next_deadline_ms(), Some(30));

        h.clock.advance_ms(30);
        assert_eq!(h.adapter.tick(), 1);
        assert_eq!(h.sim.fired_timeouts(), vec![timeout]);

        h.sim.toggle_timeout(timeout, false, 30);
        h.sim.drop_timeout(timeout);
        assert_eq!(h.adapter.timeouts().len(), 1);
    }

    #[test]
    fn queued_method_call_is_dispatched_on_next_tick() {
        let h = harness(AdapterConfig::default());
        let calc = calculator();
        h.adapter
            .register_object(h.connection.as_ref(), "/calc", calc.clone())
            .unwrap();

        let call = Message::method_call("/calc", Some("org.example.Calculator"), "Add")
            .with_arg(Value::Int32(2))
            .with_arg(Value::Int32(40))
            .with_sender(":1.99");
        h.sim.push_inbound(call);
        assert_eq!(h.adapter.next_deadline_ms(), Some(0));

        assert_eq!(h.adapter.tick(), 1);
        assert_eq!(h.sim.pending_inbound(), 0);
        assert_eq!(*calc.context.calls.lock(), ["Add=42"]);
        let sent = h.sim.take_sent();
        assert_eq!(sent[0].kind, MessageKind::MethodReturn);
        assert_eq!(sent[0].args, vec![Value::Int32(42)]);
        assert_eq!(sent[0].destination.as_deref(), Some(":1.99"));
    }

    #[test]
    fn every_announcement_queues_a_drain() {
        let h = harness(AdapterConfig::default());
        let calc = calculator();
        h.adapter
            .register_object(h.connection.as_ref(), "/calc", calc.clone())
            .unwrap();
        h.sim.push_inbound(Message::method_call("/calc", None, "Add"));
        h.sim.push_inbound(Message::method_call("/calc", None, "Add"));

        // Both one-shot drains fire; the first empties the queue.
        assert_eq!(h.adapter.tick(), 2);
        assert_eq!(calc.context.calls.lock().len(), 2);
        assert_eq!(h.adapter.next_deadline_ms(), Some(100));
    }

    #[test]
    fn disconnected_connection_is_not_drained() {
        let h = harness(AdapterConfig::default());
        h.sim.disconnect();
        h.sim.push_inbound(Message::method_call("/calc", None, "Add"));
        assert_eq!(h.adapter.next_deadline_ms(), Some(100));

        h.clock.advance_ms(100);
        h.adapter.tick();
        assert_eq!(h.sim.pending_inbound(), 1);
    }

    #[test]
    fn introspection_over_the_bus_lists_children() {
        let h = harness(AdapterConfig::default());
        let conn = h.connection.as_ref();
        h.adapter.register_object(conn, "/calc", calculator()).unwrap();
        h.adapter.register_object(conn, "/calc/sci", calculator()).unwrap();

        h.sim.push_inbound(Message::method_call("/calc", None, "Introspect"));
        h.adapter.tick();

        let sent = h.sim.take_sent();
        let xml = sent[0].args[0].as_str().unwrap();
        assert!(xml.contains("<interface name=\"org.example.Calculator\">"));
        assert!(xml.contains("<signal name=\"Overflow\"></signal>"));
        assert!(xml.contains("<node name=\"sci\"/>"));

        h.adapter.unregister_object(conn, "/calc/sci").unwrap();
        assert_eq!(h.sim.registered_paths(), ["/calc"]);
    }

    #[test]
    fn subscribed_signals_are_routed() {
        let h = harness(AdapterConfig::default());
        let calc = calculator();
        h.adapter
            .subscribe_signals(h.connection.clone(), Some(":1.50"), None, Arc::new(calc.clone()))
            .unwrap();
        assert_eq!(
            h.sim.match_rules(),
            ["type='signal',interface='org.example.Calculator',\
              interface='org.example.Display',sender=':1.50'"]
        );

        h.sim.push_inbound(
            Message::signal("/display", "org.example.Display", "Refresh").with_sender(":1.50"),
        );
        h.adapter.tick();
        assert_eq!(*calc.context.calls.lock(), ["Refresh from :1.50"]);

        h.adapter
            .unsubscribe_signals(h.connection.as_ref(), Some(":1.50"), None)
            .unwrap();
        assert!(h.sim.match_rules().is_empty());
        assert_eq!(
            h.adapter.signals().route(
                h.connection.as_ref(),
                &Message::signal("/display", "org.example.Display", "Refresh")
            ),
            HandlerResult::NotYetHandled
        );
    }

    #[test]
    fn request_name_maps_replies() {
        let h = harness(AdapterConfig::default());
        let conn = h.connection.as_ref();
        assert_eq!(
            h.adapter.request_name(conn, "org.example.Mine", false).unwrap(),
            NameReply::PrimaryOwner
        );

        h.sim.mark_name_taken("org.example.Taken");
        assert_eq!(
            h.adapter.request_name(conn, "org.example.Taken", false),
            Err(BusError::NameUnavailable("org.example.Taken".into()))
        );
        assert_eq!(
            h.adapter.request_name(conn, "org.example.Taken", true).unwrap(),
            NameReply::PrimaryOwner
        );

        h.sim.disconnect();
        assert!(matches!(
            h.adapter.request_name(conn, "org.example.Late", false),
            Err(BusError::NameRequest { .. })
        ));
    }

    #[test]
    fn connect_requests_configured_name() {
        let clock = Arc::new(ManualClock::new());
        let adapter = Adapter::with_clock(
            AdapterConfig {
                bus: BusType::System,
                name: Some("org.example.Daemon".into()),
                ..AdapterConfig::default()
            },
            clock,
        );
        let session = SimConnection::new(":1.1");
        let system = SimConnection::new(":1.2");
        let connector = SimConnector::new(session.clone(), system.clone());
        adapter.connect(&connector).unwrap();

        assert_eq!(system.owned_names(), ["org.example.Daemon"]);
        assert!(session.owned_names().is_empty());
    }

    #[test]
    fn emit_signal_sends_arguments() {
        let h = harness(AdapterConfig::default());
        let serial = emit_signal(
            h.connection.as_ref(),
            "/calc",
            "org.example.Calculator",
            "Overflow",
            [Value::Str("too big".into())],
        )
        .unwrap();

        let sent = h.sim.take_sent();
        assert_eq!(sent[0].serial, serial);
        assert_eq!(sent[0].kind, MessageKind::Signal);
        assert_eq!(sent[0].signature(), "s");
        assert_eq!(sent[0].sender.as_deref(), Some(":1.10"));
    }

    struct CountingTarget(AtomicUsize);

    impl Dispatch for CountingTarget {
        fn interfaces(&self) -> Vec<String> {
            vec!["org.example.Display".to_string()]
        }

        fn dispatch(&self, _: &dyn BusConnection, _: &Message) -> HandlerResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            HandlerResult::NotYetHandled
        }
    }

    #[test]
    fn attaching_twice_is_a_no_op() {
        let h = harness(AdapterConfig::default());
        h.sim.new_watch(Some(5), WatchFlags::READABLE, true).unwrap();

        h.adapter.attach(h.connection.clone()).unwrap();
        assert!(h.adapter.is_attached(h.connection.as_ref()));
        assert_eq!(h.adapter.watches().len(), 1);
        assert_eq!(h.adapter.timeouts().len(), 1);
        let set = h.adapter.build_poll_set().unwrap();
        assert_eq!(set.bus_len(), 1);
        h.adapter.process_poll_set(set).unwrap();
    }

    #[test]
    fn reattached_connection_routes_each_signal_once() {
        let h = harness(AdapterConfig::default());
        h.adapter.detach(&h.connection);
        assert!(!h.adapter.is_attached(h.connection.as_ref()));
        h.adapter.attach(h.connection.clone()).unwrap();

        let target = Arc::new(CountingTarget(AtomicUsize::new(0)));
        h.adapter
            .subscribe_signals(h.connection.clone(), None, None, target.clone())
            .unwrap();
        h.sim
            .push_inbound(Message::signal("/display", "org.example.Display", "Refresh"));
        h.adapter.tick();

        assert_eq!(h.sim.pending_inbound(), 0);
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_forgets_connection_state() {
        let h = harness(AdapterConfig::default());
        h.sim.new_watch(Some(3), WatchFlags::READABLE, true).unwrap();
        h.sim.new_timeout(50, true).unwrap();
        h.adapter
            .subscribe_signals(h.connection.clone(), None, None, Arc::new(calculator()))
            .unwrap();

        h.adapter.detach(&h.connection);
        assert!(!h.sim.has_hooks());
        assert!(h.adapter.watches().is_empty());
        assert!(h.adapter.timeouts().is_empty());
        assert!(h.adapter.signals().is_empty());
    }

    #[test]
    fn hooks_outliving_the_adapter_refuse_new_work() {
        let h = harness(AdapterConfig::default());
        let sim = h.sim.clone();
        drop(h);
        assert!(sim.new_watch(Some(4), WatchFlags::READABLE, true).is_err());
    }
}
