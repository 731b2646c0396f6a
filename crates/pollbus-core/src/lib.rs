//! `pollbus-core` – Registries behind the poll loop
//!
//! Holds the bookkeeping that turns the bus library's abstract watches and
//! timeouts into something a single `poll(2)` loop can drive.
//!
//! # Modules
//!
//! - [`list`] – [`IntrusiveList`][list::IntrusiveList]: lockable doubly linked
//!   list over a node arena with stable handles. Both registries below are
//!   built on it.
//! - [`watch`] – [`WatchRegistry`][watch::WatchRegistry]: builds the
//!   [`PollSet`][watch::PollSet] handed to `poll(2)` and feeds the returned
//!   events back to the bus.
//! - [`timeout`] – [`TimeoutScheduler`][timeout::TimeoutScheduler]: the
//!   ordered expiry queue advanced by `tick()`, for bus timeouts and the
//!   adapter's own timers.

pub mod list;
pub mod timeout;
pub mod watch;

pub use list::{IntrusiveList, ListCore, NodeId};
pub use timeout::{Clock, ManualClock, MonotonicClock, TimeoutScheduler, TimerCallback, TimerId};
pub use watch::{PollFd, PollSet, WatchRegistry};
