//! [`SignalRegistry`] – signal subscriptions and inbound signal routing.
//!
//! A subscription pairs a connection with optional sender and path filters
//! and a [`Dispatch`] target. Subscribing registers a bus match rule so the
//! bus starts delivering the signals; the registry's [`SignalFilter`],
//! installed on the connection as a message filter, routes them back to the
//! right target.
//!
//! Routing takes the first subscription (in registration order) whose
//! filters accept the signal and resolves against that subscription's table
//! only. If that table has no handler for the signal, it stays unhandled even
//! when a later subscription would have matched.

use std::sync::{Arc, Weak};

use pollbus_types::connection::same_connection;
use pollbus_types::{BusConnection, BusError, HandlerResult, Message, MessageFilter, MessageKind};
use tracing::{debug, warn};

use pollbus_core::list::IntrusiveList;

use crate::table::Dispatch;

struct Subscription {
    connection: Arc<dyn BusConnection>,
    sender: Option<String>,
    path: Option<String>,
    target: Option<Arc<dyn Dispatch>>,
    rule: String,
}

impl Subscription {
    fn accepts(&self, message: &Message) -> bool {
        self.path.as_deref().is_none_or(|p| message.has_path(p))
            && self.sender.as_deref().is_none_or(|s| message.has_sender(s))
    }
}

/// Bus match rule selecting the signals of `interfaces`, optionally narrowed
/// to one sender and one object path.
///
/// ```rust
/// use pollbus_dispatch::signals::match_rule;
///
/// let rule = match_rule(["org.example.A", "org.example.B"], Some(":1.7"), None);
/// assert_eq!(
///     rule,
///     "type='signal',interface='org.example.A',interface='org.example.B',sender=':1.7'"
/// );
/// ```
pub fn match_rule<'a>(
    interfaces: impl IntoIterator<Item = &'a str>,
    sender: Option<&str>,
    path: Option<&str>,
) -> String {
    let mut rule = String::from("type='signal'");
    for interface in interfaces {
        rule.push_str(&format!(",interface='{interface}'"));
    }
    if let Some(sender) = sender {
        rule.push_str(&format!(",sender='{sender}'"));
    }
    if let Some(path) = path {
        rule.push_str(&format!(",path='{path}'"));
    }
    rule
}

/// Registry of signal subscriptions across connections.
#[derive(Default)]
pub struct SignalRegistry {
    subscriptions: IntrusiveList<Subscription>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the signals of `target`'s interfaces on `connection`.
    ///
    /// # Errors
    ///
    /// Propagates the bus's refusal of the match rule, and
    /// [`BusError::OutOfMemory`] if the subscription cannot be stored (the
    /// match rule is withdrawn again in that case).
    pub fn subscribe(
        &self,
        connection: Arc<dyn BusConnection>,
        sender: Option<&str>,
        path: Option<&str>,
        target: Option<Arc<dyn Dispatch>>,
    ) -> Result<(), BusError> {
        let interfaces = target.as_ref().map(|t| t.interfaces()).unwrap_or_default();
        let rule = match_rule(interfaces.iter().map(String::as_str), sender, path);
        debug!(rule = %rule, "add signal match");
        connection.add_match(&rule)?;

        let subscription = Subscription {
            connection: connection.clone(),
            sender: sender.map(str::to_string),
            path: path.map(str::to_string),
            target,
            rule: rule.clone(),
        };
        let stored = {
            let mut core = self.subscriptions.lock();
            core.alloc(subscription).and_then(|id| core.add_tail(id))
        };
        if let Err(e) = stored {
            if let Err(undo) = connection.remove_match(&rule) {
                warn!(rule = %rule, error = %undo, "could not withdraw match rule");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop the first subscription whose connection, sender and path all
    /// equal the arguments, and withdraw its match rule.
    ///
    /// # Errors
    ///
    /// [`BusError::SubscriptionNotFound`] if nothing matches exactly; the
    /// bus's error if it refuses to remove the rule (the subscription is
    /// gone either way).
    pub fn unsubscribe(
        &self,
        connection: &dyn BusConnection,
        sender: Option<&str>,
        path: Option<&str>,
    ) -> Result<(), BusError> {
        let removed = {
            let mut core = self.subscriptions.lock();
            let found = core
                .iter()
                .find(|(_, s)| {
                    same_connection(s.connection.as_ref(), connection)
                        && s.sender.as_deref() == sender
                        && s.path.as_deref() == path
                })
                .map(|(id, _)| id);
            match found {
                Some(id) => core.release(id)?,
                None => return Err(BusError::SubscriptionNotFound),
            }
        };
        debug!(rule = %removed.rule, "remove signal match");
        connection.remove_match(&removed.rule)
    }

    /// Drop every subscription on `connection` without touching the bus.
    /// Used when the connection itself is going away.
    pub fn remove_connection(&self, connection: &dyn BusConnection) -> usize {
        let mut core = self.subscriptions.lock();
        let doomed: Vec<_> = core
            .iter()
            .filter(|(_, s)| same_connection(s.connection.as_ref(), connection))
            .map(|(id, _)| id)
            .collect();
        doomed.into_iter().filter(|id| core.release(*id).is_ok()).count()
    }

    /// Deliver an inbound signal to the first subscription that accepts it.
    pub fn route(&self, connection: &dyn BusConnection, message: &Message) -> HandlerResult {
        if message.kind != MessageKind::Signal {
            return HandlerResult::NotYetHandled;
        }
        let target = {
            let core = self.subscriptions.lock();
            core.iter()
                .map(|(_, s)| s)
                .filter(|s| same_connection(s.connection.as_ref(), connection))
                .filter(|s| s.target.is_some())
                .find(|s| s.accepts(message))
                .and_then(|s| s.target.clone())
        };
        match target {
            Some(target) => target.dispatch(connection, message),
            None => HandlerResult::NotYetHandled,
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// A message filter that routes signals into this registry. It holds
    /// only a weak reference, so the connection does not keep the registry
    /// alive.
    pub fn filter(self: &Arc<Self>) -> Arc<SignalFilter> {
        Arc::new(SignalFilter {
            registry: Arc::downgrade(self),
        })
    }
}

/// [`MessageFilter`] installed on a connection to feed [`SignalRegistry::route`].
pub struct SignalFilter {
    registry: Weak<SignalRegistry>,
}

impl MessageFilter for SignalFilter {
    fn filter(&self, connection: &dyn BusConnection, message: &Message) -> HandlerResult {
        match self.registry.upgrade() {
            Some(registry) => registry.route(connection, message),
            None => HandlerResult::NotYetHandled,
        }
    }
}
