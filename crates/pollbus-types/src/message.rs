//! Bus message model.
//!
//! Marshaling to and from the wire is the bus library's business; the adapter
//! only needs header accessors (type, path, interface, member, sender) and a
//! typed argument list for replies and signals it builds itself.

/// The kind of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// A single basic-typed message argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
}

impl Value {
    /// Bus type signature of this value.
    pub fn signature(&self) -> &'static str {
        match self {
            Value::Bool(_) => "b",
            Value::Byte(_) => "y",
            Value::Int32(_) => "i",
            Value::UInt32(_) => "u",
            Value::Int64(_) => "x",
            Value::UInt64(_) => "t",
            Value::Double(_) => "d",
            Value::Str(_) => "s",
            Value::ObjectPath(_) => "o",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }
}

/// A bus message with its routing header and arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub args: Vec<Value>,
}

impl Message {
    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            sender: None,
            destination: None,
            args: Vec::new(),
        }
    }

    /// A method call addressed to `path`. The interface is optional on the
    /// bus; pass `None` to let the receiver search every interface.
    pub fn method_call(path: &str, interface: Option<&str>, member: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            interface: interface.map(str::to_string),
            member: Some(member.to_string()),
            ..Self::empty(MessageKind::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::empty(MessageKind::Signal)
        }
    }

    /// A method return answering `call`.
    pub fn method_return(call: &Message) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::empty(MessageKind::MethodReturn)
        }
    }

    /// An error reply answering `call`.
    pub fn error(call: &Message, error_name: &str, text: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(error_name.to_string()),
            args: vec![Value::Str(text.to_string())],
            ..Self::empty(MessageKind::Error)
        }
    }

    pub fn with_arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.path.as_deref() == Some(path)
    }

    pub fn has_sender(&self, sender: &str) -> bool {
        self.sender.as_deref() == Some(sender)
    }

    /// Concatenated type signature of the arguments.
    pub fn signature(&self) -> String {
        self.args.iter().map(Value::signature).collect()
    }
}
