//! Broker error taxonomy
//!
//! Only [`BrokerError::Bind`] ever reaches the process entry point. Every
//! other variant stays inside the connection that produced it.

use shared::CodecError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The listening socket could not be opened.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// The connection failed or closed before naming its channel.
    #[error("handshake failed: {0}")]
    HandshakeRead(CodecError),

    /// A framing or stream error while reading a message pair.
    #[error("failed to read message: {0}")]
    MessageRead(CodecError),

    /// A channel frame arrived but the stream ended before its payload.
    #[error("stream ended after channel {channel} without a payload")]
    MissingPayload { channel: String },

    /// Writing a payload to one subscriber failed.
    #[error("failed to forward to subscriber {subscriber}: {source}")]
    Forward { subscriber: u64, source: CodecError },
}

impl BrokerError {
    /// Errors that only mean the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            BrokerError::HandshakeRead(e) | BrokerError::MessageRead(e) => {
                matches!(e, CodecError::Closed | CodecError::Incomplete { .. })
            }
            BrokerError::MissingPayload { .. } => true,
            _ => false,
        }
    }
}
