//! [`DispatchTable`] – data-driven routing of bus messages to typed handlers.
//!
//! A table is an ordered list of interfaces, each an ordered list of members
//! (methods or signals) with their argument descriptions and an optional
//! handler. Lookup is by string match; order matters because the first match
//! wins when a message carries no interface.
//!
//! A table is paired with the context its handlers receive through a
//! [`Binding`]. [`Dispatch`] erases the context type so bindings with
//! different contexts can share one registry.

use std::sync::Arc;

use pollbus_types::{BusConnection, BusError, HandlerResult, Message, MessageKind};
use tracing::warn;

/// Handler invoked for a resolved member.
///
/// An `Err` is logged by the caller; the message still counts as handled.
pub type Handler<T> =
    Arc<dyn Fn(&dyn BusConnection, &Message, &T) -> Result<(), BusError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// One argument of a member: name, type signature and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: String,
    pub signature: String,
    pub direction: Direction,
}

impl ArgSpec {
    pub fn input(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            direction: Direction::In,
        }
    }

    pub fn output(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            direction: Direction::Out,
        }
    }
}

pub struct Member<T> {
    name: String,
    kind: MemberKind,
    handler: Option<Handler<T>>,
    args: Vec<ArgSpec>,
}

impl<T> Member<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn handler(&self) -> Option<&Handler<T>> {
        self.handler.as_ref()
    }

    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }
}

pub struct Interface<T> {
    name: String,
    members: Vec<Member<T>>,
}

impl<T> Interface<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Member<T>] {
        &self.members
    }

    // First member with this name, handler or not.
    fn find(&self, member: &str) -> Option<&Member<T>> {
        self.members.iter().find(|m| m.name == member)
    }

    fn find_kind(&self, member: &str, kind: MemberKind) -> Option<&Member<T>> {
        self.members
            .iter()
            .find(|m| m.name == member && m.kind == kind)
    }
}

/// Immutable routing table. Build one with [`DispatchTable::builder`].
///
/// # Example
///
/// ```rust
/// use pollbus_dispatch::table::{ArgSpec, DispatchTable};
///
/// struct Counter;
///
/// let table = DispatchTable::<Counter>::builder()
///     .interface("org.example.Counter", |i| {
///         i.method("Increment", [ArgSpec::input("by", "i")], |_, _, _| Ok(()))
///             .signal("Changed", [ArgSpec::output("value", "i")])
///     })
///     .build();
///
/// assert!(table.resolve(Some("org.example.Counter"), "Increment").is_some());
/// assert!(table.resolve(None, "Increment").is_some());
/// assert!(table.resolve(Some("org.example.Other"), "Increment").is_none());
/// ```
pub struct DispatchTable<T> {
    interfaces: Vec<Interface<T>>,
}

impl<T> DispatchTable<T> {
    pub fn builder() -> DispatchTableBuilder<T> {
        DispatchTableBuilder {
            interfaces: Vec::new(),
        }
    }

    pub fn interfaces(&self) -> &[Interface<T>] {
        &self.interfaces
    }

    pub fn interface_names(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(|i| i.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Find the handler for `member`.
    ///
    /// With an interface, only that interface is searched (the first one of
    /// that name). Without one, interfaces are searched in table order and the
    /// first member of that name that has a handler wins.
    ///
    /// The member kind is not consulted: a signal handler and a method of the
    /// same name are interchangeable here. Message dispatch goes through
    /// [`DispatchTable::resolve_kind`] instead.
    pub fn resolve(&self, interface: Option<&str>, member: &str) -> Option<&Handler<T>> {
        match interface {
            Some(name) => self
                .interfaces
                .iter()
                .find(|i| i.name == name)?
                .find(member)?
                .handler
                .as_ref(),
            None => self
                .interfaces
                .iter()
                .find_map(|i| i.find(member).and_then(|m| m.handler.as_ref())),
        }
    }

    /// Like [`DispatchTable::resolve`], but only members of `kind` match.
    pub fn resolve_kind(
        &self,
        interface: Option<&str>,
        member: &str,
        kind: MemberKind,
    ) -> Option<&Handler<T>> {
        match interface {
            Some(name) => self
                .interfaces
                .iter()
                .find(|i| i.name == name)?
                .find_kind(member, kind)?
                .handler
                .as_ref(),
            None => self
                .interfaces
                .iter()
                .find_map(|i| i.find_kind(member, kind).and_then(|m| m.handler.as_ref())),
        }
    }
}

// ── Builders ────────────────────────────────────────────────────────────────

pub struct DispatchTableBuilder<T> {
    interfaces: Vec<Interface<T>>,
}

impl<T> DispatchTableBuilder<T> {
    /// Append an interface whose members are added by `build`.
    pub fn interface(
        mut self,
        name: &str,
        build: impl FnOnce(InterfaceBuilder<T>) -> InterfaceBuilder<T>,
    ) -> Self {
        let built = build(InterfaceBuilder {
            members: Vec::new(),
        });
        self.interfaces.push(Interface {
            name: name.to_string(),
            members: built.members,
        });
        self
    }

    pub fn build(self) -> DispatchTable<T> {
        DispatchTable {
            interfaces: self.interfaces,
        }
    }
}

pub struct InterfaceBuilder<T> {
    members: Vec<Member<T>>,
}

impl<T> InterfaceBuilder<T> {
    pub fn method<F>(self, name: &str, args: impl IntoIterator<Item = ArgSpec>, handler: F) -> Self
    where
        F: Fn(&dyn BusConnection, &Message, &T) -> Result<(), BusError> + Send + Sync + 'static,
    {
        self.push(name, MemberKind::Method, args, Some(Arc::new(handler)))
    }

    /// A signal this object emits. It appears in introspection but has no
    /// handler.
    pub fn signal(self, name: &str, args: impl IntoIterator<Item = ArgSpec>) -> Self {
        self.push(name, MemberKind::Signal, args, None)
    }

    /// A signal this side wants to receive, handled by `handler`.
    pub fn signal_handler<F>(
        self,
        name: &str,
        args: impl IntoIterator<Item = ArgSpec>,
        handler: F,
    ) -> Self
    where
        F: Fn(&dyn BusConnection, &Message, &T) -> Result<(), BusError> + Send + Sync + 'static,
    {
        self.push(name, MemberKind::Signal, args, Some(Arc::new(handler)))
    }

    fn push(
        mut self,
        name: &str,
        kind: MemberKind,
        args: impl IntoIterator<Item = ArgSpec>,
        handler: Option<Handler<T>>,
    ) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            kind,
            handler,
            args: args.into_iter().collect(),
        });
        self
    }
}

// ── Bindings ────────────────────────────────────────────────────────────────

/// A table together with the context its handlers receive.
pub struct Binding<T> {
    pub table: Arc<DispatchTable<T>>,
    pub context: Arc<T>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            context: self.context.clone(),
        }
    }
}

impl<T> Binding<T> {
    pub fn new(table: Arc<DispatchTable<T>>, context: Arc<T>) -> Self {
        Self { table, context }
    }
}

/// A [`Binding`] with its context type erased.
pub trait Dispatch: Send + Sync {
    /// Interface names of the table, in table order.
    fn interfaces(&self) -> Vec<String>;

    /// Resolve `message` against the table and run the handler. Method calls
    /// only reach methods and signals only reach signal handlers.
    ///
    /// Returns [`HandlerResult::NotYetHandled`] when nothing matches. A
    /// handler error is logged and the message is still reported handled.
    fn dispatch(&self, connection: &dyn BusConnection, message: &Message) -> HandlerResult;
}

impl<T: Send + Sync + 'static> Dispatch for Binding<T> {
    fn interfaces(&self) -> Vec<String> {
        self.table.interface_names().map(str::to_string).collect()
    }

    fn dispatch(&self, connection: &dyn BusConnection, message: &Message) -> HandlerResult {
        let Some(member) = message.member.as_deref() else {
            return HandlerResult::NotYetHandled;
        };
        let kind = match message.kind {
            MessageKind::MethodCall => MemberKind::Method,
            MessageKind::Signal => MemberKind::Signal,
            _ => return HandlerResult::NotYetHandled,
        };
        let Some(handler) = self
            .table
            .resolve_kind(message.interface.as_deref(), member, kind)
        else {
            return HandlerResult::NotYetHandled;
        };
        if let Err(e) = handler(connection, message, &*self.context) {
            warn!(
                member,
                path = message.path.as_deref().unwrap_or(""),
                error = %e,
                "handler failed"
            );
        }
        HandlerResult::Handled
    }
}
