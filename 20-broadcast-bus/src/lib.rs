//! Single-topic TCP broadcast bus.
//!
//! Every byte sequence a sender-eligible client publishes becomes one
//! immutable message in a shared log and is relayed, unframed and in publish
//! order, to every client connected at the time it was published. Unix only.
//!
//! The pieces, roughly in data-flow order:
//!
//! - [`listener`] binds the listening socket with an explicit backlog.
//! - [`acceptor`] admits connections into the [`registry`] and drives the
//!   [`reaper`].
//! - [`reader`] drains readable sockets, detects message boundaries and
//!   appends to the [`log`] according to the [`framing`] policy.
//! - [`writer`] fans the log out to every client from its own cursor,
//!   without letting a slow client hold up the rest.
//! - [`bus`] wires the three workers together and owns shutdown.
//! - [`events`] describes everything observable about a running bus.
//! - [`cli`], [`config`] and [`client`] back the `broadcast-bus` binary.

pub mod acceptor;
pub mod bus;
pub mod cli;
pub mod client;
pub mod config;
pub mod events;
pub mod framing;
pub mod listener;
pub mod log;
pub mod reaper;
pub mod reader;
pub mod registry;
pub mod writer;

pub use bus::{Bus, BusHandle, Stopper};
pub use config::BusConfig;
pub use events::{BusEvent, CloseReason};
