//! Fan-out loop.
//!
//! One long-lived worker pushes the log to every client from that client's
//! own cursor. Sends are non-blocking: a client whose socket buffer is full is
//! parked with its partial offset intact until the poller reports it writable
//! again, while every other client keeps making progress.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mio::{Events, Poll};
use tracing::trace;

use crate::bus::{Shutdown, WAKE_TOKEN};
use crate::events::CloseReason;
use crate::log::{Cursor, Message, MessageId, MessageLog};
use crate::registry::{Client, Registry};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
pub(crate) struct Pending {
    message: Message,
    /// Bytes of `message` already accepted by the socket.
    offset: usize,
}

/// Per-client delivery state, owned by the fan-out loop.
#[derive(Debug)]
pub(crate) struct Delivery {
    origin: MessageId,
    last_sent: Option<MessageId>,
    pending: Option<Pending>,
    /// The last send would have blocked; wait for a writable event.
    parked: bool,
}

impl Delivery {
    pub(crate) fn new(origin: MessageId) -> Self {
        Self {
            origin,
            last_sent: None,
            pending: None,
            parked: false,
        }
    }

    pub(crate) fn cursor(&self) -> Cursor {
        Cursor {
            pending: self.pending.as_ref().map(|pending| pending.message.id()),
            last_sent: self.last_sent,
            origin: self.origin,
        }
    }

    pub(crate) fn unpark(&mut self) {
        self.parked = false;
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.parked
    }

    /// Byte offset into the pending message, if one is in flight.
    pub(crate) fn pending_offset(&self) -> Option<usize> {
        self.pending.as_ref().map(|pending| pending.offset)
    }
}

/// Sends as much of the backlog as `out` accepts. Returns how many messages
/// were fully delivered.
///
/// A would-block parks the client and keeps the partial offset so the next
/// call resumes at exactly that byte. Any other write error is returned and
/// is fatal for the connection.
pub(crate) fn send_pending<W: Write>(
    delivery: &mut Delivery,
    log: &MessageLog,
    out: &mut W,
) -> io::Result<usize> {
    let mut completed = 0;
    loop {
        if delivery.pending.is_none() {
            let Some(message) = log.first_from(delivery.cursor().resume_from()) else {
                return Ok(completed);
            };
            delivery.pending = Some(Pending { message, offset: 0 });
        }
        let Some(pending) = delivery.pending.as_mut() else {
            return Ok(completed);
        };

        let remaining = &pending.message.payload()[pending.offset..];
        if !remaining.is_empty() {
            match out.write(remaining) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => pending.offset += written,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    delivery.parked = true;
                    return Ok(completed);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            if pending.offset < pending.message.len() {
                continue;
            }
        }

        delivery.last_sent = Some(pending.message.id());
        delivery.pending = None;
        completed += 1;
    }
}

/// The fan-out worker.
pub struct Fanout {
    poll: Poll,
    registry: Arc<Registry>,
    log: Arc<MessageLog>,
    timeout: Duration,
    shutdown: Arc<Shutdown>,
}

impl Fanout {
    pub(crate) fn new(
        poll: Poll,
        registry: Arc<Registry>,
        log: Arc<MessageLog>,
        timeout: Duration,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            poll,
            registry,
            log,
            timeout,
            shutdown,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut delivered = 0;
        while !self.shutdown.is_stopping() {
            // Only wait out the full timeout when the last cycle made no progress.
            let timeout = if delivered > 0 {
                Duration::ZERO
            } else {
                self.timeout
            };
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("fan-out poll failed");
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                if let Some(client) = self.registry.lookup(event.token()) {
                    client.lock_delivery().unpark();
                }
            }

            delivered = 0;
            for client in self.registry.snapshot() {
                match self.send(&client) {
                    Ok(count) => delivered += count,
                    Err(err) => {
                        self.registry
                            .destroy(&client, CloseReason::WriteFailed(err.kind()));
                    }
                }
            }
        }
        Ok(())
    }

    fn send(&self, client: &Client) -> io::Result<usize> {
        let mut delivery = client.lock_delivery();
        if delivery.is_parked() {
            return Ok(0);
        }
        let mut stream = client.outbound_stream();
        let completed = send_pending(&mut delivery, &self.log, &mut stream)?;
        if delivery.is_parked() {
            trace!(
                peer = %client.peer(),
                offset = ?delivery.pending_offset(),
                "client would block, parking"
            );
        }
        Ok(completed)
    }
}
