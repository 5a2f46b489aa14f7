//! Garbage collection for the message log.

use crate::events::{BusEvent, EventSink};
use crate::log::MessageLog;
use crate::registry::Registry;

/// Frees every message at the head of the log that no live client still
/// needs. Returns how many were freed.
///
/// Cursors are collected while the registry lock is held, so a client cannot
/// join between the scan and the release and find its next message gone.
pub fn reap(log: &MessageLog, registry: &Registry, events: &EventSink) -> usize {
    let reaped = registry.with_cursors(|cursors| log.reap_unreferenced(cursors));
    for id in &reaped {
        events.emit(BusEvent::MessageReaped { id: *id });
    }
    reaped.len()
}
