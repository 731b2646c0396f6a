//! `pollbus-dispatch` – Table-driven message dispatch
//!
//! Routes method calls and signals arriving on a bus connection to typed
//! handler functions, answers introspection requests from the same tables,
//! and keeps track of signal subscriptions.
//!
//! # Modules
//!
//! - [`table`] – [`DispatchTable`][table::DispatchTable] and
//!   [`Binding`][table::Binding]: the interface → member → handler lookup and
//!   the context a table's handlers receive.
//! - [`xml`] – [`introspect_xml`][xml::introspect_xml] and the
//!   [`ExtensibleString`][xml::ExtensibleString] buffer it writes into.
//! - [`object`] – [`ObjectDispatcher`][object::ObjectDispatcher]: the object
//!   path handler that answers `Introspect` and forwards everything else to
//!   its table.
//! - [`signals`] – [`SignalRegistry`][signals::SignalRegistry]: match rules,
//!   subscriptions and routing of inbound signals.

pub mod object;
pub mod signals;
pub mod table;
pub mod xml;

pub use object::ObjectDispatcher;
pub use signals::{SignalFilter, SignalRegistry, match_rule};
pub use table::{ArgSpec, Binding, Direction, Dispatch, DispatchTable, Handler, MemberKind};
pub use xml::{ExtensibleString, introspect_xml};
