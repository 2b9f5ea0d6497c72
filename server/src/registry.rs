//! Subscription registry for the broker
//!
//! This module tracks which connections listen on which channel:
//! - Registration when a connection completes its handshake
//! - Idempotent removal when a connection closes, fails or is cancelled
//! - Recipient selection for each published message, by channel policy
//!
//! The registry itself is a plain struct. The server shares one instance
//! between all connection handlers behind a [`SharedRegistry`] lock, which
//! is held for one call at a time and never across a network write.

use bytes::Bytes;
use log::{debug, info, warn};
use shared::{write_message, Channel, CodecError, QUEUE_PREFIX};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::policy::DeliveryPolicy;

/// Registry handle shared by the server and every connection handler
pub type SharedRegistry = Arc<Mutex<SubscriptionRegistry>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The write side of one subscribed connection
///
/// Clones share the same underlying writer; identity is the connection id.
/// Writes from concurrent publishers are serialized per subscriber so
/// frames never interleave on the wire.
#[derive(Clone)]
pub struct Subscriber {
    id: u64,
    peer: SocketAddr,
    writer: Arc<Mutex<BoxedWriter>>,
}

impl Subscriber {
    pub fn new<W>(id: u64, peer: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            id,
            peer,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one framed payload to this subscriber.
    pub async fn forward(&self, payload: &[u8]) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, payload).await
    }

    /// Shuts down the write side of the connection.
    pub async fn close(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

/// Maps each channel to its live subscribers in registration order
pub struct SubscriptionRegistry {
    channels: HashMap<Channel, VecDeque<Subscriber>>,
    queue_prefix: Bytes,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_queue_prefix(Bytes::from_static(QUEUE_PREFIX))
    }

    /// Creates a registry that treats channels starting with `prefix` as work queues
    pub fn with_queue_prefix(prefix: impl Into<Bytes>) -> Self {
        Self {
            channels: HashMap::new(),
            queue_prefix: prefix.into(),
        }
    }

    /// Wraps a new registry for sharing between handlers
    pub fn shared(prefix: impl Into<Bytes>) -> SharedRegistry {
        Arc::new(Mutex::new(Self::with_queue_prefix(prefix)))
    }

    /// Appends `subscriber` to the end of `channel`'s sequence
    ///
    /// The channel is created on demand. A subscriber belongs to one channel
    /// only, so any earlier registration under another channel is dropped.
    pub fn register(&mut self, channel: Channel, subscriber: Subscriber) {
        let id = subscriber.id;
        for (other, subs) in self.channels.iter_mut() {
            if *other != channel && subs.iter().any(|s| s.id == id) {
                warn!("Subscriber {} moved from {} to {}", id, other, channel);
                subs.retain(|s| s.id != id);
            }
        }
        self.channels.retain(|_, subs| !subs.is_empty());

        let subs = self.channels.entry(channel.clone()).or_default();
        if subs.iter().any(|s| s.id == id) {
            debug!("Subscriber {} already registered on {}", id, channel);
            return;
        }
        subs.push_back(subscriber);
        info!(
            "Subscriber {} registered on {} ({} total)",
            id,
            channel,
            subs.len()
        );
    }

    /// Removes the subscriber with `subscriber_id` from `channel`
    ///
    /// Returns true if it was found. Removing an absent subscriber is a
    /// no-op, so explicit close and error teardown can both call this.
    pub fn unregister(&mut self, channel: &Channel, subscriber_id: u64) -> bool {
        let Some(subs) = self.channels.get_mut(channel) else {
            return false;
        };

        let before = subs.len();
        subs.retain(|s| s.id != subscriber_id);
        let removed = subs.len() != before;

        if subs.is_empty() {
            self.channels.remove(channel);
        }
        if removed {
            info!("Subscriber {} unregistered from {}", subscriber_id, channel);
        }
        removed
    }

    /// Returns the subscribers that should receive the next message on `channel`
    ///
    /// Empty when nobody listens. Work-queue channels rotate their sequence
    /// and yield one subscriber; broadcast channels yield all of them.
    pub fn targets_for(&mut self, channel: &Channel) -> Vec<Subscriber> {
        let policy = self.policy_for(channel);
        match self.channels.get_mut(channel) {
            Some(subs) => policy.select(subs),
            None => Vec::new(),
        }
    }

    pub fn policy_for(&self, channel: &Channel) -> DeliveryPolicy {
        DeliveryPolicy::for_channel(channel, &self.queue_prefix)
    }

    /// Current subscribers of `channel`, in delivery order
    pub fn subscribers(&self, channel: &Channel) -> Vec<Subscriber> {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map_or(0, VecDeque::len)
    }

    /// Channel a subscriber is registered on, if any
    pub fn channel_of(&self, subscriber_id: u64) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|(_, subs)| subs.iter().any(|s| s.id == subscriber_id))
            .map(|(channel, _)| channel)
    }

    /// Number of channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Total subscribers across all channels
    pub fn len(&self) -> usize {
        self.channels.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
