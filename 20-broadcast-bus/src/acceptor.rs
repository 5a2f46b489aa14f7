//! Accept loop.
//!
//! Waits for the listener to become readable, admits every pending
//! connection, and runs a reap pass after each wake-up so garbage collection
//! keeps pace with traffic even when nobody is connecting.
//!
//! One descriptor on `/dev/null` is held in reserve. When `accept` runs out
//! of descriptors it is released long enough to accept and close whatever is
//! queued, so those peers see their connection refused instead of hanging in
//! the backlog.

use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll};

use crate::bus::{LISTENER_TOKEN, Shutdown};
use crate::config::{BusConfig, SenderPolicy};
use crate::events::{BusEvent, EventSink};
use crate::log::MessageLog;
use crate::reaper;
use crate::registry::Registry;

const EVENT_CAPACITY: usize = 16;
const SPARE_PATH: &str = "/dev/null";
const SHED_REASON: &str = "out of file descriptors";

pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    registry: Arc<Registry>,
    log: Arc<MessageLog>,
    senders: SenderPolicy,
    timeout: Duration,
    events: EventSink,
    shutdown: Arc<Shutdown>,
    spare: Option<File>,
}

impl Acceptor {
    /// `listener` must already be non-blocking.
    pub(crate) fn new(
        poll: Poll,
        listener: TcpListener,
        registry: Arc<Registry>,
        log: Arc<MessageLog>,
        config: &BusConfig,
        events: EventSink,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self> {
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .context("failed to watch listener")?;
        let spare = File::open(SPARE_PATH).context("failed to reserve a spare descriptor")?;
        Ok(Self {
            poll,
            listener,
            registry,
            log,
            senders: config.senders.clone(),
            timeout: config.accept_timeout,
            events,
            shutdown,
            spare: Some(spare),
        })
    }

    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        // A failed accept can leave connections queued without a fresh edge,
        // so retry on the next cycle regardless of readiness.
        let mut retry = false;
        while !self.shutdown.is_stopping() {
            if let Err(err) = self.poll.poll(&mut events, Some(self.timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("acceptor poll failed");
            }

            let readable = events.iter().any(|event| event.token() == LISTENER_TOKEN);
            if readable || retry {
                retry = !self.accept_pending();
            }
            reaper::reap(&self.log, &self.registry, &self.events);
        }
        Ok(())
    }

    /// Accepts until the backlog is empty. Returns `false` if an accept error
    /// cut the pass short.
    fn accept_pending(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.admit(stream, peer);
                    reaper::reap(&self.log, &self.registry, &self.events);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.events.emit(BusEvent::accept_failed(&err));
                    if out_of_descriptors(&err) {
                        return self.shed_pending();
                    }
                    return false;
                }
            }
        }
    }

    /// Closes every queued connection using the spare descriptor. Returns
    /// `true` once the backlog is empty and the spare is held again.
    fn shed_pending(&mut self) -> bool {
        self.spare = None;
        let drained = loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    drop(stream);
                    self.events.emit(BusEvent::ConnectionRejected {
                        peer,
                        reason: SHED_REASON.to_string(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.events.emit(BusEvent::accept_failed(&err));
                    break false;
                }
            }
        };
        self.spare = File::open(SPARE_PATH).ok();
        drained && self.spare.is_some()
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let sender = self.senders.permits(&peer);
        match self.registry.register(stream, peer, sender, &self.log) {
            Ok(_) => self
                .events
                .emit(BusEvent::ConnectionAccepted { peer, sender }),
            Err(err) => self.events.emit(BusEvent::ConnectionRejected {
                peer,
                reason: err.to_string(),
            }),
        }
    }
}

fn out_of_descriptors(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
}
