//! Descriptor exhaustion in the accept loop. Lives in its own test binary
//! because it lowers the open-file limit of the whole process.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use broadcast_bus::{Bus, BusConfig, BusEvent};
use crossbeam_channel::Receiver;
use socket2::{Domain, Socket, Type};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const LOWERED_LIMIT: libc::rlim_t = 256;

/// Keeps the process at its open-file limit until dropped, then gives the
/// descriptors back and restores the original limit.
struct Exhausted {
    files: Vec<File>,
    original: libc::rlimit,
}

impl Exhausted {
    fn new() -> Result<Self> {
        let original = get_limit()?;
        set_limit(&libc::rlimit {
            rlim_cur: original.rlim_cur.min(LOWERED_LIMIT),
            rlim_max: original.rlim_max,
        })?;
        let mut exhausted = Self {
            files: Vec::new(),
            original,
        };
        loop {
            match File::open("/dev/null") {
                Ok(file) => exhausted.files.push(file),
                Err(err) if err.raw_os_error() == Some(libc::EMFILE) => return Ok(exhausted),
                Err(err) => return Err(err).context("failed to open /dev/null"),
            }
            if exhausted.files.len() > LOWERED_LIMIT as usize {
                bail!("open-file limit was not enforced");
            }
        }
    }
}

impl Drop for Exhausted {
    fn drop(&mut self) {
        self.files.clear();
        let _ = set_limit(&self.original);
    }
}

fn get_limit() -> Result<libc::rlimit> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error()).context("getrlimit failed");
    }
    Ok(limit)
}

fn set_limit(limit: &libc::rlimit) -> Result<()> {
    // SAFETY: `limit` points to an initialized rlimit.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) } != 0 {
        return Err(io::Error::last_os_error()).context("setrlimit failed");
    }
    Ok(())
}

fn wait_for(
    events: &Receiver<BusEvent>,
    matches: impl Fn(&BusEvent) -> bool,
) -> Result<BusEvent> {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(remaining)
            .map_err(|_| anyhow!("timed out waiting for bus event"))?;
        if matches(&event) {
            return Ok(event);
        }
    }
}

fn connect(addr: SocketAddr, events: &Receiver<BusEvent>) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let local = stream.local_addr()?;
    wait_for(
        events,
        |event| matches!(event, BusEvent::ConnectionAccepted { peer, .. } if *peer == local),
    )?;
    Ok(stream)
}

#[test]
fn acceptor_outlives_descriptor_exhaustion() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let (tx, events) = crossbeam_channel::unbounded();
    let config = BusConfig {
        accept_timeout: Duration::from_millis(20),
        read_timeout: Duration::from_millis(20),
        write_timeout: Duration::from_millis(10),
        ..BusConfig::default()
    };
    let handle = Bus::new(listener, config)?.with_observer(tx).start()?;
    let addr = handle.local_addr();

    // Opened up front: connecting needs no new descriptor on this side.
    let early = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    early.bind(&"127.0.0.1:0".parse::<SocketAddr>()?.into())?;
    let early_addr = early
        .local_addr()?
        .as_socket()
        .context("bound socket has no inet address")?;

    let exhausted = Exhausted::new()?;
    early.connect(&addr.into())?;

    let failure = wait_for(&events, |event| matches!(event, BusEvent::AcceptFailed { .. }))?;
    match failure {
        BusEvent::AcceptFailed { code, message, .. } => {
            assert_eq!(code, Some(libc::EMFILE));
            assert!(!message.is_empty());
        }
        other => bail!("unexpected event {other:?}"),
    }
    // The queued connection is closed rather than left in the backlog.
    wait_for(
        &events,
        |event| matches!(event, BusEvent::ConnectionRejected { peer, .. } if *peer == early_addr),
    )?;
    drop(exhausted);

    let mut refused: TcpStream = early.into();
    refused.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 16];
    match refused.read(&mut buf) {
        Ok(0) => {}
        Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {}
        other => bail!("expected the refused connection to be closed, got {other:?}"),
    }

    // With descriptors available again the bus admits and serves clients.
    let mut listener = connect(addr, &events)?;
    let mut talker = connect(addr, &events)?;
    talker.write_all(b"recovered")?;
    let mut heard = [0u8; 9];
    listener.read_exact(&mut heard)?;
    assert_eq!(&heard, b"recovered");
    assert_eq!(handle.client_count(), 2);

    handle.shutdown()
}
