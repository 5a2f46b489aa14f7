//! Tunables consumed by the bus core.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, ensure};
use clap::ValueEnum;

use crate::framing::{BangFraming, FramePolicy, RawFraming};

pub const DEFAULT_LISTEN_BACKLOG: i32 = 50;
pub const DEFAULT_INITIAL_BUFFER: usize = 128;
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(50);
/// Used when the open-file limit cannot be queried.
pub const FALLBACK_MAX_CONNECTIONS: usize = 1024;
/// Descriptors kept back from the open-file limit for everything that is not
/// a client: stdio, pollers, wakers, the listener, the async runtime.
pub const RESERVED_DESCRIPTORS: usize = 32;
/// Each client holds its socket twice, once per I/O loop.
pub const DESCRIPTORS_PER_CLIENT: usize = 2;

/// How inbound frames are interpreted once a boundary is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Framing {
    /// Every frame is broadcast as-is.
    #[default]
    Raw,
    /// `!payload` publishes `payload`, `ping\n` is a keep-alive.
    Bang,
}

impl Framing {
    pub fn policy(self) -> Box<dyn FramePolicy> {
        match self {
            Framing::Raw => Box::new(RawFraming),
            Framing::Bang => Box::new(BangFraming),
        }
    }
}

/// What happens to a connection whose message outgrows the buffer ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OverflowPolicy {
    #[default]
    Disconnect,
    /// Drop the oversized message and keep the connection.
    Discard,
}

/// Decides at accept time whether a connection may publish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SenderPolicy {
    #[default]
    Everyone,
    Allowlist(Vec<IpAddr>),
}

impl SenderPolicy {
    pub fn permits(&self, peer: &SocketAddr) -> bool {
        match self {
            SenderPolicy::Everyone => true,
            SenderPolicy::Allowlist(allowed) => allowed.contains(&peer.ip()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub listen_backlog: i32,
    /// Size of a client's scratch buffer when it is first allocated.
    pub initial_buffer: usize,
    /// Largest a client's scratch buffer may grow before its message is dropped.
    pub max_buffer: usize,
    pub accept_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_connections: usize,
    pub framing: Framing,
    pub overflow: OverflowPolicy,
    pub senders: SenderPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            initial_buffer: DEFAULT_INITIAL_BUFFER,
            max_buffer: DEFAULT_MAX_BUFFER,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_connections: default_max_connections(),
            framing: Framing::default(),
            overflow: OverflowPolicy::default(),
            senders: SenderPolicy::default(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.listen_backlog > 0, "listen backlog must be positive");
        ensure!(self.initial_buffer > 0, "initial buffer size must be positive");
        ensure!(
            self.max_buffer >= self.initial_buffer,
            "max buffer size ({}) is smaller than the initial size ({})",
            self.max_buffer,
            self.initial_buffer
        );
        ensure!(self.max_connections > 0, "connection ceiling must be positive");
        // Connection handles pack the slot index into the low half of a token.
        ensure!(
            u32::try_from(self.max_connections).is_ok(),
            "connection ceiling {} is too large",
            self.max_connections
        );
        Ok(())
    }
}

/// How many clients fit in `fd_limit` descriptors, never less than one.
pub fn connection_budget(fd_limit: usize) -> usize {
    (fd_limit.saturating_sub(RESERVED_DESCRIPTORS) / DESCRIPTORS_PER_CLIENT).max(1)
}

/// Connection ceiling sized so the registry fills before descriptors run out.
pub fn default_max_connections() -> usize {
    open_file_limit().map_or(FALLBACK_MAX_CONNECTIONS, connection_budget)
}

/// Soft limit on open file descriptors for this process.
pub fn open_file_limit() -> Option<usize> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
        // SAFETY: rlim points to writable memory sized for an rlimit.
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } == 0 {
            // SAFETY: getrlimit returned 0, so rlim is initialized.
            let rlim = unsafe { rlim.assume_init() };
            if rlim.rlim_cur == libc::RLIM_INFINITY {
                return None;
            }
            return usize::try_from(rlim.rlim_cur).ok();
        }
        None
    }
    #[cfg(not(unix))]
    {
        None
    }
}
