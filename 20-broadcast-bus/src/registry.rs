//! The set of live connections.
//!
//! Clients live in an arena of slots. Each occupied slot is also a node of a
//! doubly linked list in registration order, so removal is O(1) and iteration
//! follows connection order. The slot index doubles as the direct index the
//! I/O loops use to map a readiness token back to its client; both views are
//! only ever changed together, under the one registry lock.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mio::unix::SourceFd;
use mio::{Interest, Token};
use thiserror::Error;
use tracing::debug;

use crate::events::{BusEvent, CloseReason, EventSink};
use crate::log::{Cursor, MessageId, MessageLog};
use crate::reader::Inbound;
use crate::writer::Delivery;

const SLOT_BITS: u32 = usize::BITS / 2;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;
const GENERATION_MASK: u32 = (usize::MAX >> SLOT_BITS) as u32;

/// Connection handle: a slot in the direct index plus the generation of
/// that slot, so a stale readiness event never resolves to a newer client
/// that reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    slot: u32,
    generation: u32,
}

impl ClientHandle {
    pub fn token(self) -> Token {
        Token(((self.generation as usize) << SLOT_BITS) | self.slot as usize)
    }

    pub fn from_token(token: Token) -> Self {
        Self {
            slot: (token.0 & SLOT_MASK) as u32,
            generation: (token.0 >> SLOT_BITS) as u32,
        }
    }

    pub fn slot(self) -> usize {
        self.slot as usize
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("registry is full ({limit} connections)")]
    Full { limit: usize },
    #[error("failed to prepare connection: {0}")]
    Io(#[from] io::Error),
}

/// One TCP connection.
///
/// The socket is held twice: the inbound side is watched by the ingestion
/// loop and the outbound side (a duplicate of the same socket) by the fan-out
/// loop, so each loop can wait on its own poller. Read state and delivery
/// state sit behind separate locks because each is owned by a different loop.
pub struct Client {
    handle: ClientHandle,
    peer: SocketAddr,
    sender: bool,
    inbound_stream: mio::net::TcpStream,
    outbound_stream: mio::net::TcpStream,
    inbound: Mutex<Inbound>,
    delivery: Mutex<Delivery>,
    closed: AtomicBool,
}

/// Both halves of an accepted socket, ready to be handed to the pollers.
struct Prepared {
    inbound: mio::net::TcpStream,
    outbound: mio::net::TcpStream,
}

impl Prepared {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let outbound = stream.try_clone()?;
        Ok(Self {
            inbound: mio::net::TcpStream::from_std(stream),
            outbound: mio::net::TcpStream::from_std(outbound),
        })
    }
}

impl Client {
    fn new(
        handle: ClientHandle,
        sockets: Prepared,
        peer: SocketAddr,
        sender: bool,
        origin: MessageId,
    ) -> Self {
        Self {
            handle,
            peer,
            sender,
            inbound_stream: sockets.inbound,
            outbound_stream: sockets.outbound,
            inbound: Mutex::new(Inbound::default()),
            delivery: Mutex::new(Delivery::new(origin)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_sender(&self) -> bool {
        self.sender
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn inbound_stream(&self) -> &mio::net::TcpStream {
        &self.inbound_stream
    }

    pub(crate) fn outbound_stream(&self) -> &mio::net::TcpStream {
        &self.outbound_stream
    }

    pub(crate) fn lock_inbound(&self) -> MutexGuard<'_, Inbound> {
        self.inbound.lock().expect("client read state lock poisoned")
    }

    pub(crate) fn lock_delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().expect("client delivery lock poisoned")
    }

    pub fn cursor(&self) -> Cursor {
        self.lock_delivery().cursor()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .field("sender", &self.sender)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Entry {
    client: Arc<Client>,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl Slots {
    fn allocate(&mut self, limit: usize) -> Option<u32> {
        if let Some(slot) = self.free.pop() {
            return Some(slot);
        }
        if self.slots.len() >= limit {
            return None;
        }
        let slot = u32::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot::default());
        Some(slot)
    }

    fn release(&mut self, slot: u32) {
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1) & GENERATION_MASK;
        self.free.push(slot);
    }

    fn link(&mut self, slot: u32, client: Arc<Client>) {
        let prev = self.tail;
        self.slots[slot as usize].entry = Some(Entry {
            client,
            prev,
            next: None,
        });
        match prev.and_then(|prev| self.slots[prev as usize].entry.as_mut()) {
            Some(tail) => tail.next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
    }

    fn get(&self, handle: ClientHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.slot())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Unlinks the client in `handle`'s slot if it is still `client`.
    fn remove(&mut self, handle: ClientHandle, client: &Client) -> bool {
        let Some(entry) = self.get(handle) else {
            return false;
        };
        if !std::ptr::eq(Arc::as_ptr(&entry.client), client) {
            return false;
        }
        let Some(entry) = self.slots[handle.slot()].entry.take() else {
            return false;
        };

        match entry.prev.and_then(|prev| self.slots[prev as usize].entry.as_mut()) {
            Some(prev) => prev.next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next.and_then(|next| self.slots[next as usize].entry.as_mut()) {
            Some(next) => next.prev = entry.prev,
            None => self.tail = entry.prev,
        }
        self.len -= 1;
        self.release(handle.slot);
        true
    }

    fn iter(&self) -> SlotIter<'_> {
        SlotIter {
            slots: self,
            cursor: self.head,
        }
    }
}

struct SlotIter<'a> {
    slots: &'a Slots,
    cursor: Option<u32>,
}

impl<'a> Iterator for SlotIter<'a> {
    type Item = &'a Arc<Client>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.slots.slots[self.cursor? as usize].entry.as_ref()?;
        self.cursor = entry.next;
        Some(&entry.client)
    }
}

/// The client registry shared by the acceptor and both I/O loops.
pub struct Registry {
    slots: Mutex<Slots>,
    limit: usize,
    read_interest: mio::Registry,
    write_interest: mio::Registry,
    events: EventSink,
}

impl Registry {
    /// `read_interest` and `write_interest` belong to the ingestion and
    /// fan-out pollers; every registered client is watched by both.
    pub fn new(
        limit: usize,
        read_interest: mio::Registry,
        write_interest: mio::Registry,
        events: EventSink,
    ) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            limit,
            read_interest,
            write_interest,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().expect("client registry lock poisoned")
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds client state for an accepted socket and makes it visible to the
    /// I/O loops.
    ///
    /// Only slot allocation, the cursor origin and linking happen under the
    /// registry lock; socket setup runs before it and poller registration
    /// after it. The delivery cursor starts at the log position observed while
    /// the lock is held, so the reaper can never see the client without also
    /// honouring its starting point. On failure the socket is dropped, which
    /// closes it.
    pub fn register(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        sender: bool,
        log: &MessageLog,
    ) -> Result<Arc<Client>, RegisterError> {
        if self.len() >= self.limit {
            return Err(RegisterError::Full { limit: self.limit });
        }
        let sockets = Prepared::new(stream)?;

        let client = {
            let mut slots = self.lock();
            let Some(slot) = slots.allocate(self.limit) else {
                return Err(RegisterError::Full { limit: self.limit });
            };
            let handle = ClientHandle {
                slot,
                generation: slots.slots[slot as usize].generation,
            };
            let client = Arc::new(Client::new(handle, sockets, peer, sender, log.next_id()));
            slots.link(slot, Arc::clone(&client));
            client
        };

        // Registering a socket that is already readable or writable still
        // reports it, so nothing that arrived before this point is missed.
        if let Err(err) = self.watch(&client) {
            if !client.closed.swap(true, Ordering::AcqRel) {
                self.unregister(&client);
            }
            self.unwatch(&client);
            return Err(err.into());
        }
        // Torn down by another loop before it was watched.
        if client.is_closed() {
            self.unwatch(&client);
        }
        Ok(client)
    }

    fn watch(&self, client: &Client) -> io::Result<()> {
        let token = client.handle.token();
        let inbound = client.inbound_stream.as_raw_fd();
        let outbound = client.outbound_stream.as_raw_fd();
        self.read_interest
            .register(&mut SourceFd(&inbound), token, Interest::READABLE)?;
        self.write_interest
            .register(&mut SourceFd(&outbound), token, Interest::WRITABLE)
    }

    /// Removes the client from the list and the direct index. Returns `false`
    /// if it had already been removed.
    pub fn unregister(&self, client: &Client) -> bool {
        self.lock().remove(client.handle, client)
    }

    /// Tears a client down: unregisters it, stops both pollers watching it and
    /// shuts the socket. Safe to call from any loop, any number of times; only
    /// the first call has an effect. The descriptors close once the last
    /// reference held by an in-flight cycle is dropped.
    pub fn destroy(&self, client: &Client, reason: CloseReason) -> bool {
        if client.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.unregister(client);
        self.unwatch(client);
        if let Err(err) = client.inbound_stream.shutdown(Shutdown::Both) {
            debug!(peer = %client.peer, error = ?err, "shutdown after teardown failed");
        }
        self.events.emit(BusEvent::ConnectionClosed {
            peer: client.peer,
            reason,
        });
        true
    }

    fn unwatch(&self, client: &Client) {
        let inbound = client.inbound_stream.as_raw_fd();
        let outbound = client.outbound_stream.as_raw_fd();
        if let Err(err) = self.read_interest.deregister(&mut SourceFd(&inbound)) {
            debug!(peer = %client.peer, error = ?err, "failed to stop read polling");
        }
        if let Err(err) = self.write_interest.deregister(&mut SourceFd(&outbound)) {
            debug!(peer = %client.peer, error = ?err, "failed to stop write polling");
        }
    }

    /// Maps a readiness token back to its live client.
    pub fn lookup(&self, token: Token) -> Option<Arc<Client>> {
        let handle = ClientHandle::from_token(token);
        self.lock().get(handle).map(|entry| Arc::clone(&entry.client))
    }

    /// Live clients in registration order, taken under the registry lock.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.lock().iter().cloned().collect()
    }

    /// Runs `f` over every live client's cursor while holding the registry
    /// lock, so no client can join or leave until `f` returns.
    pub fn with_cursors<R>(&self, f: impl FnOnce(&[Cursor]) -> R) -> R {
        let slots = self.lock();
        let cursors: Vec<Cursor> = slots.iter().map(|client| client.cursor()).collect();
        f(&cursors)
    }

    /// Tears down every client; used when the bus stops.
    pub fn destroy_all(&self, reason: CloseReason) {
        for client in self.snapshot() {
            self.destroy(&client, reason.clone());
        }
    }
}
