//! [`ObjectDispatcher`] – the handler registered for an object path.
//!
//! Method calls on the path are answered from a [`Binding`]. `Introspect` is
//! always answered here from the table itself and never reaches a user
//! handler.

use pollbus_types::{
    BusConnection, BusError, HandlerResult, Message, MessageKind, ObjectPathHandler, Value,
};
use tracing::{debug, warn};

use crate::table::{Binding, Dispatch};
use crate::xml::introspect_xml;

/// Member name answered with introspection data.
pub const INTROSPECT_MEMBER: &str = "Introspect";

pub struct ObjectDispatcher<T> {
    binding: Binding<T>,
}

impl<T: Send + Sync + 'static> ObjectDispatcher<T> {
    pub fn new(binding: Binding<T>) -> Self {
        Self { binding }
    }

    pub fn binding(&self) -> &Binding<T> {
        &self.binding
    }

    fn introspect(&self, connection: &dyn BusConnection, call: &Message) -> Result<(), BusError> {
        let path = call.path.as_deref().unwrap_or("/");
        let children = connection.list_registered(path)?;
        let xml = introspect_xml(&self.binding.table, &children)?;
        connection.send(Message::method_return(call).with_arg(Value::Str(xml)))?;
        Ok(())
    }
}

impl<T: Send + Sync + 'static> ObjectPathHandler for ObjectDispatcher<T> {
    fn handle_message(&self, connection: &dyn BusConnection, message: &Message) -> HandlerResult {
        if message.kind != MessageKind::MethodCall {
            return HandlerResult::NotYetHandled;
        }
        let Some(member) = message.member.as_deref() else {
            return HandlerResult::NotYetHandled;
        };

        if member == INTROSPECT_MEMBER {
            debug!(path = message.path.as_deref().unwrap_or(""), "introspect");
            return match self.introspect(connection, message) {
                Ok(()) => HandlerResult::Handled,
                Err(e) => {
                    warn!(error = %e, "introspection failed");
                    HandlerResult::NotYetHandled
                }
            };
        }

        self.binding.dispatch(connection, message)
    }
}
