//! Interpretation of inbound frames.
//!
//! The reader decides *where* a message ends (see [`crate::reader`]); a
//! [`FramePolicy`] decides *what* the completed frame means.

/// Meaning of one completed inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Append these bytes to the log.
    Publish(&'a [u8]),
    /// Control traffic with no effect.
    KeepAlive,
    Unrecognized,
}

pub trait FramePolicy: Send + Sync {
    fn classify<'a>(&self, frame: &'a [u8]) -> Frame<'a>;
}

/// Broadcasts every frame unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFraming;

impl FramePolicy for RawFraming {
    fn classify<'a>(&self, frame: &'a [u8]) -> Frame<'a> {
        Frame::Publish(frame)
    }
}

pub const PUBLISH_PREFIX: u8 = b'!';
pub const KEEP_ALIVE: &[u8] = b"ping\n";

/// `!` publishes the rest of the frame; `ping\n` is a keep-alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct BangFraming;

impl FramePolicy for BangFraming {
    fn classify<'a>(&self, frame: &'a [u8]) -> Frame<'a> {
        match frame.split_first() {
            Some((&PUBLISH_PREFIX, payload)) => Frame::Publish(payload),
            _ if frame.starts_with(KEEP_ALIVE) => Frame::KeepAlive,
            _ => Frame::Unrecognized,
        }
    }
}
