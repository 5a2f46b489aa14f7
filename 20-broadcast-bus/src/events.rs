//! Observability hooks.
//!
//! Every notable state change in the bus is described by a [`BusEvent`]. The
//! [`EventSink`] logs each event through `tracing` and, when an observer has
//! been attached, forwards a copy over a channel.

use std::io;
use std::net::SocketAddr;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::log::MessageId;

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end (a read returned zero bytes).
    PeerClosed,
    ReadFailed(io::ErrorKind),
    WriteFailed(io::ErrorKind),
    /// An inbound message outgrew the buffer ceiling.
    Overflow,
    /// A message or buffer could not be allocated.
    OutOfMemory,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::ReadFailed(kind) => write!(f, "read failed: {kind}"),
            CloseReason::WriteFailed(kind) => write!(f, "write failed: {kind}"),
            CloseReason::Overflow => f.write_str("buffer overflow"),
            CloseReason::OutOfMemory => f.write_str("out of memory"),
            CloseReason::Shutdown => f.write_str("bus shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    ConnectionAccepted {
        peer: SocketAddr,
        sender: bool,
    },
    /// Turned away at accept time, e.g. because the registry is full.
    ConnectionRejected {
        peer: SocketAddr,
        reason: String,
    },
    ConnectionClosed {
        peer: SocketAddr,
        reason: CloseReason,
    },
    /// `accept` failed. `code` is the OS error number when there is one, so
    /// descriptor exhaustion (`EMFILE`/`ENFILE`) can be told apart.
    AcceptFailed {
        kind: io::ErrorKind,
        code: Option<i32>,
        message: String,
    },
    MessageCreated {
        id: MessageId,
        len: usize,
        peer: SocketAddr,
    },
    MessageReaped {
        id: MessageId,
    },
    /// Inbound bytes were dropped because they outgrew the buffer ceiling.
    BufferOverflow {
        peer: SocketAddr,
        discarded: usize,
    },
    /// A connection without publish rights sent a message.
    PublishRejected {
        peer: SocketAddr,
        len: usize,
    },
    UnrecognizedFrame {
        peer: SocketAddr,
        len: usize,
    },
}

impl BusEvent {
    pub fn accept_failed(err: &io::Error) -> Self {
        BusEvent::AcceptFailed {
            kind: err.kind(),
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct EventSink {
    observer: Option<Sender<BusEvent>>,
}

impl EventSink {
    pub fn new(observer: Option<Sender<BusEvent>>) -> Self {
        Self { observer }
    }

    pub fn emit(&self, event: BusEvent) {
        trace_event(&event);
        if let Some(observer) = &self.observer {
            // A dropped observer only means nobody is listening any more.
            let _ = observer.send(event);
        }
    }
}

fn trace_event(event: &BusEvent) {
    match event {
        BusEvent::ConnectionAccepted { peer, sender } => {
            info!(peer = %peer, sender, "client connected")
        }
        BusEvent::ConnectionRejected { peer, reason } => {
            warn!(peer = %peer, reason = %reason, "connection rejected")
        }
        BusEvent::ConnectionClosed { peer, reason } => {
            info!(peer = %peer, reason = %reason, "client disconnected")
        }
        BusEvent::AcceptFailed {
            kind,
            code,
            message,
        } => warn!(
            error = %message,
            kind = ?kind,
            code = ?code,
            "failed to accept connection"
        ),
        BusEvent::MessageCreated { id, len, peer } => {
            debug!(id = %id, len, peer = %peer, "created message")
        }
        BusEvent::MessageReaped { id } => debug!(id = %id, "reaped message"),
        BusEvent::BufferOverflow { peer, discarded } => {
            warn!(peer = %peer, discarded, "buffer overflow, discarding message")
        }
        BusEvent::PublishRejected { peer, len } => {
            warn!(peer = %peer, len, "client is not allowed to send messages")
        }
        BusEvent::UnrecognizedFrame { peer, len } => {
            warn!(peer = %peer, len, "unknown message")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_receives_emitted_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = EventSink::new(Some(tx));
        let peer: SocketAddr = "127.0.0.1:4000".parse().expect("addr");

        sink.emit(BusEvent::PublishRejected { peer, len: 3 });

        assert_eq!(
            rx.try_recv().expect("event forwarded"),
            BusEvent::PublishRejected { peer, len: 3 }
        );
    }

    #[test]
    fn emitting_without_observer_is_fine() {
        let sink = EventSink::default();
        sink.emit(BusEvent::MessageReaped {
            id: MessageId::FIRST,
        });
    }

    #[test]
    fn accept_failures_keep_the_os_error() {
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        let event = BusEvent::accept_failed(&err);
        match event {
            BusEvent::AcceptFailed { code, message, .. } => {
                assert_eq!(code, Some(libc::EMFILE));
                assert!(message.contains("os error"), "unexpected message: {message}");
            }
            other => panic!("expected an accept failure, got {other:?}"),
        }
    }

    #[test]
    fn close_reasons_render_for_logs() {
        assert_eq!(
            CloseReason::WriteFailed(io::ErrorKind::BrokenPipe).to_string(),
            format!("write failed: {}", io::ErrorKind::BrokenPipe)
        );
        assert_eq!(CloseReason::PeerClosed.to_string(), "peer closed");
    }
}
