//! Append-only message log.
//!
//! Messages are stored oldest-first in a deque and addressed by a
//! monotonically increasing [`MessageId`]. Because the log only grows at the
//! tail and only shrinks at the head, the ids of the live messages are always
//! contiguous, so any live message is found in O(1) from its id and the
//! neighbours of a message are simply `id - 1` and `id + 1`.
//!
//! Payloads are reference counted. A fan-out worker that has resolved a
//! message keeps its bytes alive even if the entry is unlinked from the log
//! while the send is in flight, so reading never races with freeing.

use std::collections::{TryReserveError, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Position of a message in the global publish order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl MessageId {
    pub const FIRST: MessageId = MessageId(1);

    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One published payload. Never mutated after creation.
#[derive(Clone)]
pub struct Message {
    id: MessageId,
    payload: Arc<[u8]>,
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Delivery progress of one client, as seen by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Message currently being sent, possibly partially.
    pub pending: Option<MessageId>,
    /// Most recent message fully delivered.
    pub last_sent: Option<MessageId>,
    /// First id the client is entitled to: the log position when it joined.
    pub origin: MessageId,
}

impl Cursor {
    pub fn starting_at(origin: MessageId) -> Self {
        Self {
            pending: None,
            last_sent: None,
            origin,
        }
    }

    /// The id the client should be sent next once its pending message is done.
    pub fn resume_from(&self) -> MessageId {
        self.last_sent.map_or(self.origin, MessageId::next)
    }

    /// Whether this client still points at `id` or has not yet advanced past it.
    pub fn retains(&self, id: MessageId) -> bool {
        self.pending == Some(id) || self.last_sent == Some(id) || id >= self.resume_from()
    }
}

struct LogInner {
    messages: VecDeque<Message>,
    next_id: MessageId,
}

impl LogInner {
    fn index_of(&self, id: MessageId) -> Option<usize> {
        let head = self.messages.front()?.id;
        if id < head {
            return None;
        }
        let index = usize::try_from(id.0 - head.0).ok()?;
        (index < self.messages.len()).then_some(index)
    }
}

/// The shared, totally ordered message log.
pub struct MessageLog {
    inner: Mutex<LogInner>,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                messages: VecDeque::new(),
                next_id: MessageId::FIRST,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        // A poisoned log means a worker died mid-mutation; nothing is safe to continue with.
        self.inner.lock().expect("message log lock poisoned")
    }

    /// Copies `payload` into a new message linked at the tail.
    ///
    /// The copy is made before the lock is taken. If memory cannot be reserved
    /// the log is left untouched.
    pub fn append(&self, payload: &[u8]) -> Result<Message, TryReserveError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(payload.len())?;
        bytes.extend_from_slice(payload);
        let payload: Arc<[u8]> = bytes.into();

        let mut inner = self.lock();
        inner.messages.try_reserve(1)?;
        let message = Message {
            id: inner.next_id,
            payload,
        };
        inner.next_id = inner.next_id.next();
        inner.messages.push_back(message.clone());
        Ok(message)
    }

    /// Number of live (unreaped) messages.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// The id the next appended message will receive.
    pub fn next_id(&self) -> MessageId {
        self.lock().next_id
    }

    pub fn head_id(&self) -> Option<MessageId> {
        self.lock().messages.front().map(Message::id)
    }

    pub fn tail_id(&self) -> Option<MessageId> {
        self.lock().messages.back().map(Message::id)
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        let inner = self.lock();
        inner.index_of(id).map(|index| inner.messages[index].clone())
    }

    /// Oldest live message whose id is at least `id`.
    pub fn first_from(&self, id: MessageId) -> Option<Message> {
        let inner = self.lock();
        let head = inner.messages.front()?;
        if id <= head.id {
            return Some(head.clone());
        }
        inner.index_of(id).map(|index| inner.messages[index].clone())
    }

    /// Unlinks every head message that no cursor retains, stopping at the
    /// first one that is still needed. Returns the ids that were freed.
    ///
    /// Liveness is recomputed from `cursors` for every message; nothing is
    /// cached between calls.
    pub fn reap_unreferenced(&self, cursors: &[Cursor]) -> Vec<MessageId> {
        let mut inner = self.lock();
        let mut reaped = Vec::new();
        while let Some(head) = inner.messages.front() {
            let id = head.id;
            if cursors.iter().any(|cursor| cursor.retains(id)) {
                break;
            }
            inner.messages.pop_front();
            reaped.push(id);
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(payloads: &[&str]) -> MessageLog {
        let log = MessageLog::new();
        for payload in payloads {
            log.append(payload.as_bytes()).expect("append");
        }
        log
    }

    #[test]
    fn append_assigns_increasing_ids_and_copies_payload() {
        let log = MessageLog::new();
        let mut source = b"hello".to_vec();
        let first = log.append(&source).expect("append");
        source[0] = b'j';
        let second = log.append(&source).expect("append");

        assert_eq!(first.id(), MessageId::FIRST);
        assert_eq!(second.id(), MessageId::FIRST.next());
        assert_eq!(first.payload(), b"hello");
        assert_eq!(second.payload(), b"jello");
        assert_eq!(log.len(), 2);
        assert_eq!(log.head_id(), Some(first.id()));
        assert_eq!(log.tail_id(), Some(second.id()));
        assert_eq!(log.next_id().get(), 3);
    }

    #[test]
    fn first_from_skips_forward_and_stops_at_tail() {
        let log = filled(&["a", "b", "c"]);
        assert_eq!(log.first_from(MessageId(0)).map(|m| m.id()), Some(MessageId(1)));
        assert_eq!(log.first_from(MessageId(2)).map(|m| m.id()), Some(MessageId(2)));
        assert!(log.first_from(MessageId(4)).is_none());
        assert_eq!(log.get(MessageId(3)).map(|m| m.payload().to_vec()), Some(b"c".to_vec()));
    }

    #[test]
    fn reap_without_clients_frees_everything() {
        let log = filled(&["a", "b"]);
        let reaped = log.reap_unreferenced(&[]);
        assert_eq!(reaped, vec![MessageId(1), MessageId(2)]);
        assert!(log.is_empty());
        assert!(log.head_id().is_none());
        // ids keep counting after the log drains
        assert_eq!(log.append(b"c").expect("append").id(), MessageId(3));
    }

    #[test]
    fn reap_stops_at_pending_message() {
        let log = filled(&["a", "b", "c"]);
        let cursor = Cursor {
            pending: Some(MessageId(2)),
            last_sent: Some(MessageId(1)),
            origin: MessageId(1),
        };
        assert!(log.reap_unreferenced(&[cursor]).is_empty());

        let advanced = Cursor {
            pending: Some(MessageId(3)),
            last_sent: Some(MessageId(2)),
            ..cursor
        };
        assert_eq!(log.reap_unreferenced(&[advanced]), vec![MessageId(1)]);
        assert_eq!(log.head_id(), Some(MessageId(2)));
    }

    #[test]
    fn reap_keeps_messages_a_client_has_not_reached() {
        let log = filled(&["a", "b", "c"]);
        let fresh = Cursor::starting_at(MessageId(2));
        assert_eq!(log.reap_unreferenced(&[fresh]), vec![MessageId(1)]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn reap_honours_the_slowest_client() {
        let log = filled(&["a", "b", "c", "d"]);
        let fast = Cursor {
            pending: None,
            last_sent: Some(MessageId(4)),
            origin: MessageId(1),
        };
        let slow = Cursor {
            pending: None,
            last_sent: Some(MessageId(2)),
            origin: MessageId(1),
        };
        assert_eq!(log.reap_unreferenced(&[fast, slow]), vec![MessageId(1)]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn cursor_resume_point_follows_last_sent() {
        let mut cursor = Cursor::starting_at(MessageId(5));
        assert_eq!(cursor.resume_from(), MessageId(5));
        assert!(!cursor.retains(MessageId(4)));
        assert!(cursor.retains(MessageId(5)));

        cursor.last_sent = Some(MessageId(7));
        assert_eq!(cursor.resume_from(), MessageId(8));
        assert!(cursor.retains(MessageId(7)));
        assert!(!cursor.retains(MessageId(6)));
    }
}
