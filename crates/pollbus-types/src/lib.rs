//! `pollbus-types` – shared vocabulary for the poll-driven bus adapter.
//!
//! Every other crate in the workspace speaks in terms of the types defined
//! here: the crate-wide [`BusError`], the opaque handles the bus library hands
//! out for watches and timeouts, the flag sets exchanged with `poll(2)` and
//! with the bus, and the [`Message`] model.
//!
//! # Modules
//!
//! - [`connection`] – the collaborator traits ([`BusConnection`],
//!   [`MainLoopHooks`], [`ObjectPathHandler`], [`MessageFilter`],
//!   [`BusConnector`]) the adapter depends on instead of a concrete bus.
//! - [`message`] – [`Message`], [`MessageKind`] and the [`Value`] argument
//!   model.
//! - [`sim`] – [`SimConnection`][sim::SimConnection], an in-process bus used
//!   by tests and headless hosts.

pub mod connection;
pub mod message;
pub mod sim;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use connection::{BusConnection, BusConnector, MainLoopHooks, MessageFilter, ObjectPathHandler};
pub use message::{Message, MessageKind, Value};

/// Opaque identifier of a watch owned by the bus library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u64);

/// Opaque identifier of a timeout owned by the bus library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutHandle(pub u64);

/// Which well-known bus to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    #[default]
    Session,
    System,
}

impl std::fmt::Display for BusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusType::Session => write!(f, "session"),
            BusType::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for BusType {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(BusType::Session),
            "system" => Ok(BusType::System),
            other => Err(BusError::InvalidArgument(format!("unknown bus type '{other}'"))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Flag sets
// ────────────────────────────────────────────────────────────────────────────

/// Event vocabulary of the bus library's watches.
///
/// Used both for the interest a watch declares (readable / writable) and for
/// the conditions reported back through [`BusConnection::handle_watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WatchFlags(u8);

impl WatchFlags {
    pub const NONE: WatchFlags = WatchFlags(0);
    pub const READABLE: WatchFlags = WatchFlags(0b0001);
    pub const WRITABLE: WatchFlags = WatchFlags(0b0010);
    pub const ERROR: WatchFlags = WatchFlags(0b0100);
    pub const HANGUP: WatchFlags = WatchFlags(0b1000);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` when every flag of `other` is also set in `self`.
    pub fn contains(self, other: WatchFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for WatchFlags {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        WatchFlags(self.0 | other.0)
    }
}

impl std::ops::BitOrAssign for WatchFlags {
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// `poll(2)` event bits, with the Linux values so a slot array can be handed
/// to the system call unchanged.
pub mod poll_events {
    pub const POLLIN: i16 = 0x001;
    pub const POLLPRI: i16 = 0x002;
    pub const POLLOUT: i16 = 0x004;
    pub const POLLERR: i16 = 0x008;
    pub const POLLHUP: i16 = 0x010;
    pub const POLLWRBAND: i16 = 0x200;
}

/// Outcome of offering a message to a handler, filter, or object path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The message was consumed; later handlers must not see it.
    Handled,
    /// Nobody claimed the message; an outer dispatch chain may still do so.
    NotYetHandled,
}

/// Whether the bus still has queued inbound data after a dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    DataRemains,
    Complete,
    NeedMemory,
}

/// Flags passed along with a well-known name request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameFlags {
    pub allow_replacement: bool,
    pub replace_existing: bool,
    pub do_not_queue: bool,
}

/// Reply codes of a well-known name request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Crate-wide error type spanning list misuse, allocation failures, bus
/// failures, and handler failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("List node is already linked")]
    AlreadyLinked,

    #[error("List node is not linked")]
    NotLinked,

    #[error("List node handle is stale or unknown")]
    StaleNode,

    #[error("Allocation failed: {0}")]
    OutOfMemory(String),

    #[error("Bus connection error: {0}")]
    Connection(String),

    #[error("Name request for {name} failed: {reason}")]
    NameRequest { name: String, reason: String },

    #[error("Name {0} is already owned and cannot be replaced")]
    NameUnavailable(String),

    #[error("Object path {path}: {details}")]
    ObjectPath { path: String, details: String },

    #[error("Match rule {rule}: {details}")]
    MatchRule { rule: String, details: String },

    #[error("No signal subscription matches the given connection, sender, and path")]
    SubscriptionNotFound,

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
