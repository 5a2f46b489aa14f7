//! Ingestion loop.
//!
//! One long-lived worker waits for any registered connection to become
//! readable and drains it into that client's scratch buffer.
//!
//! # Message boundaries
//!
//! A message is considered complete the moment a read returns fewer bytes
//! than were asked for. A read that fills the buffer exactly means more bytes
//! may follow, so the buffer doubles and reading continues. This matches
//! existing senders, which write each message in one call, but it is not a
//! robust framing over a stream transport: a message split across TCP
//! segments can be cut short, and two messages that arrive together are
//! merged into one.

use std::collections::TryReserveError;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mio::{Events, Poll, Waker};
use tracing::{debug, trace};

use crate::bus::{Shutdown, WAKE_TOKEN};
use crate::config::{BusConfig, OverflowPolicy};
use crate::events::{BusEvent, CloseReason, EventSink};
use crate::framing::{Frame, FramePolicy};
use crate::log::MessageLog;
use crate::registry::{Client, Registry};

const EVENT_CAPACITY: usize = 256;

/// Per-client inbound scratch state, owned by the ingestion loop.
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    buffer: Vec<u8>,
    offset: usize,
    /// Set after an overflow under the discard policy: the rest of the
    /// oversized message is dropped up to its boundary.
    skipping: bool,
}

/// Outcome of recording one read into an [`Inbound`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The read filled the buffer; it has grown and more bytes are expected.
    Grew,
    /// A short read ended a message occupying the first `len` bytes.
    Complete(usize),
    /// The message outgrew the ceiling; `discarded` accumulated bytes were dropped.
    Overflow { discarded: usize },
    /// Bytes belonging to an already discarded message were dropped.
    Skipped,
}

impl Inbound {
    /// The unfilled part of the buffer, allocating it on first use.
    pub(crate) fn spare(&mut self, initial: usize) -> Result<&mut [u8], TryReserveError> {
        if self.buffer.is_empty() {
            self.buffer.try_reserve_exact(initial)?;
            self.buffer.resize(initial, 0);
        }
        Ok(&mut self.buffer[self.offset..])
    }

    /// Records that `read` of the `requested` spare bytes were filled.
    pub(crate) fn record(
        &mut self,
        read: usize,
        requested: usize,
        max: usize,
    ) -> Result<Progress, TryReserveError> {
        if self.skipping {
            self.offset = 0;
            if read < requested {
                self.skipping = false;
            }
            return Ok(Progress::Skipped);
        }

        self.offset += read;
        if read < requested {
            let len = self.offset;
            self.offset = 0;
            return Ok(Progress::Complete(len));
        }

        let capacity = self.buffer.len();
        let doubled = capacity.saturating_mul(2);
        if doubled > max {
            let discarded = self.offset;
            self.offset = 0;
            self.skipping = true;
            return Ok(Progress::Overflow { discarded });
        }
        self.buffer.try_reserve_exact(doubled - capacity)?;
        self.buffer.resize(doubled, 0);
        Ok(Progress::Grew)
    }

    pub(crate) fn frame(&self, len: usize) -> &[u8] {
        &self.buffer[..len]
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

/// The ingestion worker.
pub struct Ingestion {
    poll: Poll,
    registry: Arc<Registry>,
    log: Arc<MessageLog>,
    policy: Box<dyn FramePolicy>,
    initial_buffer: usize,
    max_buffer: usize,
    overflow: OverflowPolicy,
    timeout: Duration,
    events: EventSink,
    fanout: Arc<Waker>,
    shutdown: Arc<Shutdown>,
}

impl Ingestion {
    pub(crate) fn new(
        poll: Poll,
        registry: Arc<Registry>,
        log: Arc<MessageLog>,
        config: &BusConfig,
        events: EventSink,
        fanout: Arc<Waker>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            poll,
            registry,
            log,
            policy: config.framing.policy(),
            initial_buffer: config.initial_buffer,
            max_buffer: config.max_buffer,
            overflow: config.overflow,
            timeout: config.read_timeout,
            events,
            fanout,
            shutdown,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        while !self.shutdown.is_stopping() {
            if let Err(err) = self.poll.poll(&mut events, Some(self.timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("ingestion poll failed");
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                // The client may have been torn down since the event fired.
                let Some(client) = self.registry.lookup(event.token()) else {
                    continue;
                };
                if let Err(reason) = self.drain(&client) {
                    self.registry.destroy(&client, reason);
                }
            }
        }
        Ok(())
    }

    /// Reads until the socket would block, publishing every completed message.
    fn drain(&self, client: &Client) -> Result<(), CloseReason> {
        let mut inbound = client.lock_inbound();
        let mut stream = client.inbound_stream();
        loop {
            let spare = inbound
                .spare(self.initial_buffer)
                .map_err(|_| CloseReason::OutOfMemory)?;
            let requested = spare.len();
            let read = match stream.read(spare) {
                Ok(0) => return Err(CloseReason::PeerClosed),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(CloseReason::ReadFailed(err.kind())),
            };

            let progress = inbound
                .record(read, requested, self.max_buffer)
                .map_err(|_| CloseReason::OutOfMemory)?;
            match progress {
                Progress::Grew => {
                    trace!(peer = %client.peer(), capacity = inbound.capacity(), "grew read buffer");
                }
                Progress::Complete(len) => self.dispatch(client, inbound.frame(len))?,
                Progress::Overflow { discarded } => {
                    self.events.emit(BusEvent::BufferOverflow {
                        peer: client.peer(),
                        discarded,
                    });
                    if self.overflow == OverflowPolicy::Disconnect {
                        return Err(CloseReason::Overflow);
                    }
                }
                Progress::Skipped => {}
            }
        }
    }

    fn dispatch(&self, client: &Client, frame: &[u8]) -> Result<(), CloseReason> {
        match self.policy.classify(frame) {
            Frame::Publish(payload) if client.is_sender() => {
                let message = self
                    .log
                    .append(payload)
                    .map_err(|_| CloseReason::OutOfMemory)?;
                self.events.emit(BusEvent::MessageCreated {
                    id: message.id(),
                    len: message.len(),
                    peer: client.peer(),
                });
                if let Err(err) = self.fanout.wake() {
                    debug!(error = ?err, "failed to wake fan-out loop");
                }
            }
            Frame::Publish(payload) => self.events.emit(BusEvent::PublishRejected {
                peer: client.peer(),
                len: payload.len(),
            }),
            Frame::KeepAlive => trace!(peer = %client.peer(), "keep-alive"),
            Frame::Unrecognized => self.events.emit(BusEvent::UnrecognizedFrame {
                peer: client.peer(),
                len: frame.len(),
            }),
        }
        Ok(())
    }
}
