use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    BusConfig, DEFAULT_INITIAL_BUFFER, DEFAULT_LISTEN_BACKLOG, DEFAULT_MAX_BUFFER, Framing,
    OverflowPolicy, SenderPolicy, default_max_connections,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bus, rebroadcasting every message to every connected client.
    Serve(ServeArgs),
    /// Connect to a bus, publishing stdin lines and printing what arrives.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:10001")]
    pub listen: SocketAddr,

    /// Pending-connection queue length for the listening socket.
    #[arg(long, default_value_t = DEFAULT_LISTEN_BACKLOG)]
    pub backlog: i32,

    /// Bytes allocated for a client's read buffer on first use.
    #[arg(long, default_value_t = DEFAULT_INITIAL_BUFFER)]
    pub initial_buffer: usize,

    /// Largest a client's read buffer may grow before its message is dropped.
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER)]
    pub max_buffer: usize,

    /// How long the accept loop waits before running a reap pass.
    #[arg(long, default_value_t = 5000)]
    pub accept_timeout_ms: u64,

    #[arg(long, default_value_t = 250)]
    pub read_timeout_ms: u64,

    #[arg(long, default_value_t = 50)]
    pub write_timeout_ms: u64,

    /// Connection ceiling. Defaults to what the open-file limit can hold.
    #[arg(long)]
    pub max_connections: Option<usize>,

    #[arg(long, value_enum, default_value_t = Framing::Raw)]
    pub framing: Framing,

    /// What to do when an inbound message outgrows --max-buffer.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::Disconnect)]
    pub overflow: OverflowPolicy,

    /// Only these addresses may publish. Repeatable; everyone may when absent.
    #[arg(long = "sender")]
    pub senders: Vec<IpAddr>,
}

impl ServeArgs {
    pub fn config(&self) -> BusConfig {
        let senders = if self.senders.is_empty() {
            SenderPolicy::Everyone
        } else {
            SenderPolicy::Allowlist(self.senders.clone())
        };
        BusConfig {
            listen_backlog: self.backlog,
            initial_buffer: self.initial_buffer,
            max_buffer: self.max_buffer,
            accept_timeout: Duration::from_millis(self.accept_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            max_connections: self
                .max_connections
                .unwrap_or_else(default_max_connections),
            framing: self.framing,
            overflow: self.overflow,
            senders,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the bus to connect to.
    #[arg(long, default_value = "127.0.0.1:10001")]
    pub server: SocketAddr,

    /// Framing the bus was started with; `bang` prefixes each line with `!`.
    #[arg(long, value_enum, default_value_t = Framing::Raw)]
    pub framing: Framing,
}
