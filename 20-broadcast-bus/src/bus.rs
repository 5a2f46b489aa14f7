//! Wiring for the three long-lived workers.
//!
//! [`Bus::start`] spawns the acceptor, ingestion and fan-out loops on named
//! threads and hands back a [`BusHandle`]. Each loop owns its own [`Poll`];
//! the loops share the [`MessageLog`] and the [`Registry`] and nothing else.
//! A shared [`Shutdown`] flag plus one [`Waker`] per poll lets any thread stop
//! all three promptly, and a worker that exits for any reason stops the rest.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Sender;
use mio::{Poll, Token, Waker};
use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::config::BusConfig;
use crate::events::{BusEvent, CloseReason, EventSink};
use crate::log::MessageLog;
use crate::reader::Ingestion;
use crate::registry::Registry;
use crate::writer::Fanout;

/// Reserved for the per-poll waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);
/// Reserved for the listening socket in the acceptor's poll.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

pub(crate) struct Shutdown {
    stopping: AtomicBool,
    wakers: Vec<Arc<Waker>>,
}

impl Shutdown {
    fn new(wakers: Vec<Arc<Waker>>) -> Self {
        Self {
            stopping: AtomicBool::new(false),
            wakers,
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn trigger(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for waker in &self.wakers {
            if let Err(err) = waker.wake() {
                debug!(error = ?err, "failed to wake worker for shutdown");
            }
        }
    }
}

/// Stops the bus when the owning worker returns or unwinds.
struct StopOnExit(Arc<Shutdown>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

/// A configured bus that has not started yet.
pub struct Bus {
    listener: TcpListener,
    config: BusConfig,
    observer: Option<Sender<BusEvent>>,
}

impl Bus {
    pub fn new(listener: TcpListener, config: BusConfig) -> Result<Self> {
        config.validate()?;
        listener
            .set_nonblocking(true)
            .context("failed to make listener non-blocking")?;
        Ok(Self {
            listener,
            config,
            observer: None,
        })
    }

    /// Forwards every [`BusEvent`] to `observer` in addition to tracing it.
    pub fn with_observer(mut self, observer: Sender<BusEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    pub fn start(self) -> Result<BusHandle> {
        let local_addr = self.local_addr()?;
        let events = EventSink::new(self.observer);

        let accept_poll = Poll::new().context("failed to create acceptor poll")?;
        let read_poll = Poll::new().context("failed to create ingestion poll")?;
        let write_poll = Poll::new().context("failed to create fan-out poll")?;
        let accept_waker = Arc::new(Waker::new(accept_poll.registry(), WAKE_TOKEN)?);
        let read_waker = Arc::new(Waker::new(read_poll.registry(), WAKE_TOKEN)?);
        let write_waker = Arc::new(Waker::new(write_poll.registry(), WAKE_TOKEN)?);
        let shutdown = Arc::new(Shutdown::new(vec![
            accept_waker,
            read_waker,
            Arc::clone(&write_waker),
        ]));

        let log = Arc::new(MessageLog::new());
        let registry = Arc::new(Registry::new(
            self.config.max_connections,
            read_poll.registry().try_clone()?,
            write_poll.registry().try_clone()?,
            events.clone(),
        ));

        let acceptor = Acceptor::new(
            accept_poll,
            self.listener,
            Arc::clone(&registry),
            Arc::clone(&log),
            &self.config,
            events.clone(),
            Arc::clone(&shutdown),
        )?;
        let ingestion = Ingestion::new(
            read_poll,
            Arc::clone(&registry),
            Arc::clone(&log),
            &self.config,
            events,
            write_waker,
            Arc::clone(&shutdown),
        );
        let fanout = Fanout::new(
            write_poll,
            Arc::clone(&registry),
            Arc::clone(&log),
            self.config.write_timeout,
            Arc::clone(&shutdown),
        );

        let mut handle = BusHandle {
            local_addr,
            log,
            registry,
            shutdown,
            workers: Vec::with_capacity(3),
        };
        handle.spawn("bus-acceptor", move || acceptor.run())?;
        handle.spawn("bus-ingestion", move || ingestion.run())?;
        handle.spawn("bus-fanout", move || fanout.run())?;
        info!(
            %local_addr,
            max_connections = self.config.max_connections,
            "bus started"
        );
        Ok(handle)
    }
}

/// Cloneable trigger that stops a running bus from any thread.
#[derive(Clone)]
pub struct Stopper(Arc<Shutdown>);

impl Stopper {
    pub fn stop(&self) {
        self.0.trigger();
    }
}

/// A running bus. Dropping the handle stops the workers without joining them.
pub struct BusHandle {
    local_addr: SocketAddr,
    log: Arc<MessageLog>,
    registry: Arc<Registry>,
    shutdown: Arc<Shutdown>,
    workers: Vec<(String, JoinHandle<Result<()>>)>,
}

impl BusHandle {
    fn spawn<F>(&mut self, name: &str, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let guard = StopOnExit(Arc::clone(&self.shutdown));
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                work()
            })
            .with_context(|| format!("failed to spawn {name}"))?;
        self.workers.push((name.to_string(), worker));
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stopper(&self) -> Stopper {
        Stopper(Arc::clone(&self.shutdown))
    }

    /// Stops every worker and waits for them to exit.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.trigger();
        self.wait()
    }

    /// Blocks until every worker has exited, then closes all remaining
    /// connections. Returns the first worker failure, if any.
    pub fn wait(mut self) -> Result<()> {
        let mut failure = None;
        for (name, worker) in std::mem::take(&mut self.workers) {
            let outcome = match worker.join() {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.context(format!("{name} failed")),
                Err(_) => anyhow!("{name} panicked"),
            };
            if failure.is_none() {
                failure = Some(outcome);
            }
        }
        self.registry.destroy_all(CloseReason::Shutdown);
        info!(retained = self.log.len(), "bus stopped");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
