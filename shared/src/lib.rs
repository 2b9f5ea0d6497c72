//! Types and wire helpers shared by the broker server and its clients.
//!
//! A broker connection carries nothing but length-prefixed frames (see
//! [`codec`]). The first frame a client sends names the channel it
//! subscribes to; every later pair of frames is a channel name followed by
//! an opaque payload.

pub mod codec;

use bytes::Bytes;
use std::fmt;

pub use codec::{read_message, read_message_with_limit, write_message, CodecError};

/// Channel name prefix that selects single-recipient, round-robin delivery.
pub const QUEUE_PREFIX: &[u8] = b"/queue";
/// Channel a publish-only client declares at handshake.
pub const NULL_CHANNEL: &[u8] = b"/null";
/// Upper bound on a single frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 25000;

/// A channel name as raw bytes.
///
/// Cloning is a reference count bump, so channels can be passed around the
/// registry and handlers freely.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(Bytes);

impl Channel {
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self(name.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the name starts with `prefix`, i.e. the channel is a work queue.
    pub fn is_work_queue_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Work-queue check against the default [`QUEUE_PREFIX`].
    pub fn is_work_queue(&self) -> bool {
        self.is_work_queue_with(QUEUE_PREFIX)
    }
}

impl From<&'static str> for Channel {
    fn from(name: &'static str) -> Self {
        Self(Bytes::from_static(name.as_bytes()))
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        Self(Bytes::from(name))
    }
}

impl From<Bytes> for Channel {
    fn from(name: Bytes) -> Self {
        Self(name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// One `(channel, payload)` pair read from a publishing connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: Channel,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(channel: impl Into<Channel>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// First bytes of the payload, for log lines.
    pub fn preview(&self) -> &[u8] {
        let end = self.payload.len().min(19);
        &self.payload[..end]
    }
}
