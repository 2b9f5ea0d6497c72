//! Per-connection protocol driver
//!
//! A connection sends one frame naming the channel it subscribes to, then
//! any number of `(channel, payload)` frame pairs. Each pair is forwarded
//! to whatever the registry selects for that channel. Whatever ends the
//! session, the connection is unregistered before its writer is closed.

use bytes::Bytes;
use log::{debug, info, warn};
use shared::{read_message_with_limit, Channel, CodecError, Envelope};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::task::JoinSet;

use crate::error::BrokerError;
use crate::registry::{SharedRegistry, Subscriber};
use crate::shutdown::ShutdownSignal;
use crate::stats::BrokerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingSubscription,
    Active,
    Closing,
    Closed,
}

/// Everything a handler borrows from the server that spawned it
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: SharedRegistry,
    pub stats: Arc<BrokerStats>,
    pub shutdown: ShutdownSignal,
    pub max_frame_len: usize,
}

/// How one read cycle of the active loop ended
enum Read {
    Envelope(Envelope),
    EndOfSession,
}

pub struct ConnectionHandler<S> {
    id: u64,
    peer: SocketAddr,
    reader: ReadHalf<S>,
    subscriber: Subscriber,
    channel: Option<Channel>,
    state: HandlerState,
    ctx: HandlerContext,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(id: u64, peer: SocketAddr, stream: S, ctx: HandlerContext) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id,
            peer,
            reader,
            subscriber: Subscriber::new(id, peer, writer),
            channel: None,
            state: HandlerState::AwaitingSubscription,
            ctx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Drives the connection until it closes, fails or is cancelled.
    ///
    /// Returns the error that ended the session, if any. A clean disconnect
    /// or cancellation is `Ok`.
    pub async fn run(mut self) -> Result<(), BrokerError> {
        let mut shutdown = self.ctx.shutdown.clone();

        let handshake = tokio::select! {
            _ = shutdown.cancelled() => None,
            read = read_message_with_limit(&mut self.reader, self.ctx.max_frame_len) => Some(read),
        };

        let channel = match handshake {
            Some(Ok(name)) => Channel::from(name),
            Some(Err(e)) => {
                // Nothing was registered, just drop the connection.
                self.release().await;
                return Err(BrokerError::HandshakeRead(e));
            }
            None => {
                debug!("Conn {}: cancelled before subscribing", self.id);
                self.release().await;
                return Ok(());
            }
        };

        {
            let mut registry = self.ctx.registry.lock().await;
            registry.register(channel.clone(), self.subscriber.clone());
        }
        self.channel = Some(channel.clone());
        self.transition(HandlerState::Active);
        info!("Remote {} subscribed to {}", self.peer, channel);

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Remote {} closing connection", self.peer);
                Ok(())
            }
            result = self.serve() => result,
        };

        self.close().await;
        result
    }

    async fn serve(&mut self) -> Result<(), BrokerError> {
        loop {
            match self.read_envelope().await? {
                Read::Envelope(envelope) => self.dispatch(envelope).await,
                Read::EndOfSession => {
                    info!("Remote {} disconnected", self.peer);
                    return Ok(());
                }
            }
        }
    }

    async fn read_envelope(&mut self) -> Result<Read, BrokerError> {
        let max = self.ctx.max_frame_len;

        let channel = match read_message_with_limit(&mut self.reader, max).await {
            Ok(name) => Channel::from(name),
            Err(CodecError::Closed) => return Ok(Read::EndOfSession),
            Err(e) => return Err(BrokerError::MessageRead(e)),
        };
        if channel.is_empty() {
            return Ok(Read::EndOfSession);
        }

        let payload = read_message_with_limit(&mut self.reader, max)
            .await
            .map_err(|e| match e {
                CodecError::Closed => BrokerError::MissingPayload {
                    channel: channel.to_string(),
                },
                e => BrokerError::MessageRead(e),
            })?;

        self.ctx.stats.record_message();
        Ok(Read::Envelope(Envelope { channel, payload }))
    }

    /// Forwards one envelope to its targets concurrently.
    ///
    /// The registry lock is released before any write. A failed write is
    /// logged and counted but never ends this connection, and the failing
    /// subscriber stays registered until its own handler notices.
    ///
    /// Returns only once every delivery has finished. A target that stops
    /// reading holds up this sender's next pair, whatever channel it names,
    /// but never the other targets of the same pair.
    async fn dispatch(&self, envelope: Envelope) {
        let targets = {
            let mut registry = self.ctx.registry.lock().await;
            registry.targets_for(&envelope.channel)
        };

        if targets.is_empty() {
            self.ctx.stats.record_dropped();
            debug!(
                "Conn {}: no subscribers on {}, dropping {} bytes",
                self.id,
                envelope.channel,
                envelope.payload.len()
            );
            return;
        }

        debug!(
            "Conn {}: sending to {} ({} target(s)): {:?}...",
            self.id,
            envelope.channel,
            targets.len(),
            Bytes::copy_from_slice(envelope.preview())
        );

        let mut deliveries = JoinSet::new();
        for target in targets {
            let payload = envelope.payload.clone();
            deliveries.spawn(async move {
                let result = target.forward(&payload).await;
                (target.id(), target.peer(), result)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => self.ctx.stats.record_delivery(),
                Ok((subscriber, peer, Err(source))) => {
                    self.ctx.stats.record_forward_failure();
                    let err = BrokerError::Forward { subscriber, source };
                    warn!("Conn {}: {} ({})", self.id, err, peer);
                }
                Err(e) => {
                    self.ctx.stats.record_forward_failure();
                    warn!("Conn {}: delivery task failed: {}", self.id, e);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.transition(HandlerState::Closing);
        if let Some(channel) = self.channel.take() {
            let mut registry = self.ctx.registry.lock().await;
            registry.unregister(&channel, self.id);
        }
        self.release().await;
    }

    async fn release(&mut self) {
        if let Err(e) = self.subscriber.close().await {
            debug!("Conn {}: error closing writer: {}", self.id, e);
        }
        self.transition(HandlerState::Closed);
        info!("Remote {} closed", self.peer);
    }

    fn transition(&mut self, next: HandlerState) {
        debug!("Conn {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriptionRegistry;
    use crate::shutdown::ShutdownHandle;
    use shared::{read_message, write_message};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    struct Harness {
        registry: SharedRegistry,
        stats: Arc<BrokerStats>,
        shutdown: ShutdownHandle,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: SubscriptionRegistry::shared("/queue"),
                stats: Arc::new(BrokerStats::new()),
                shutdown: ShutdownHandle::new(),
            }
        }

        fn ctx(&self) -> HandlerContext {
            HandlerContext {
                registry: Arc::clone(&self.registry),
                stats: Arc::clone(&self.stats),
                shutdown: self.shutdown.signal(),
                max_frame_len: 1024,
            }
        }

        /// Spawns a handler and returns the client end of its stream.
        fn connect(&self, id: u64) -> (DuplexStream, JoinHandle<Result<(), BrokerError>>) {
            let (client, server) = tokio::io::duplex(4096);
            let peer: SocketAddr = format!("127.0.0.1:{}", 10000 + id).parse().unwrap();
            let handler = ConnectionHandler::new(id, peer, server, self.ctx());
            (client, tokio::spawn(handler.run()))
        }

        async fn subscriber_count(&self, channel: &str) -> usize {
            self.registry
                .lock()
                .await
                .subscriber_count(&Channel::from(channel.to_string()))
        }

        async fn wait_for_subscribers(&self, channel: &str, n: usize) {
            timeout(Duration::from_secs(1), async {
                while self.subscriber_count(channel).await != n {
                    sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("subscriber count never reached");
        }
    }

    async fn publish(stream: &mut DuplexStream, channel: &str, payload: &[u8]) {
        write_message(stream, channel.as_bytes()).await.unwrap();
        write_message(stream, payload).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream) -> Bytes {
        timeout(Duration::from_secs(1), read_message(stream))
            .await
            .expect("timed out waiting for message")
            .unwrap()
    }

    #[test]
    fn test_new_handler_awaits_subscription() {
        let harness = Harness::new();
        let (_client, server) = tokio::io::duplex(64);
        let handler = ConnectionHandler::new(
            1,
            "127.0.0.1:10001".parse().unwrap(),
            server,
            harness.ctx(),
        );

        assert_eq!(handler.id(), 1);
        assert_eq!(handler.state(), HandlerState::AwaitingSubscription);
    }

    #[tokio::test]
    async fn test_handshake_registers_subscriber() {
        let harness = Harness::new();
        let (mut client, _task) = harness.connect(1);

        write_message(&mut client, b"/topic/foo").await.unwrap();

        harness.wait_for_subscribers("/topic/foo", 1).await;
    }

    #[tokio::test]
    async fn test_disconnect_before_handshake() {
        let harness = Harness::new();
        let (client, task) = harness.connect(1);

        drop(client);

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(BrokerError::HandshakeRead(CodecError::Closed))
        ));
        assert!(harness.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let harness = Harness::new();
        let (mut s1, _t1) = harness.connect(1);
        let (mut s2, _t2) = harness.connect(2);
        let (mut sender, _t3) = harness.connect(3);

        write_message(&mut s1, b"/topic/foo").await.unwrap();
        write_message(&mut s2, b"/topic/foo").await.unwrap();
        write_message(&mut sender, b"/null").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 2).await;
        harness.wait_for_subscribers("/null", 1).await;

        publish(&mut sender, "/topic/foo", b"hello").await;

        assert_eq!(&recv(&mut s1).await[..], b"hello");
        assert_eq!(&recv(&mut s2).await[..], b"hello");
    }

    #[tokio::test]
    async fn test_work_queue_distributes_round_robin() {
        let harness = Harness::new();
        let mut workers = Vec::new();
        for id in 1..=3 {
            let (mut w, task) = harness.connect(id);
            write_message(&mut w, b"/queue/jobs").await.unwrap();
            harness.wait_for_subscribers("/queue/jobs", id as usize).await;
            workers.push((w, task));
        }
        let (mut sender, _t) = harness.connect(4);
        write_message(&mut sender, b"/null").await.unwrap();

        for payload in [b"1", b"2", b"3"] {
            publish(&mut sender, "/queue/jobs", payload).await;
        }

        assert_eq!(&recv(&mut workers[0].0).await[..], b"1");
        assert_eq!(&recv(&mut workers[1].0).await[..], b"2");
        assert_eq!(&recv(&mut workers[2].0).await[..], b"3");
    }

    #[tokio::test]
    async fn test_publish_to_empty_channel_is_dropped() {
        let harness = Harness::new();
        let (mut sender, task) = harness.connect(1);
        write_message(&mut sender, b"/null").await.unwrap();

        publish(&mut sender, "/topic/nobody", b"lost").await;
        timeout(Duration::from_secs(1), async {
            while harness.stats.snapshot().dropped == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(!task.is_finished());
        assert_eq!(harness.stats.snapshot().deliveries, 0);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let harness = Harness::new();
        let (mut client, task) = harness.connect(1);
        write_message(&mut client, b"/topic/foo").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 1).await;

        drop(client);

        assert!(task.await.unwrap().is_ok());
        assert_eq!(harness.subscriber_count("/topic/foo").await, 0);
    }

    #[tokio::test]
    async fn test_empty_channel_frame_ends_session() {
        let harness = Harness::new();
        let (mut client, task) = harness.connect(1);
        write_message(&mut client, b"/topic/foo").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 1).await;

        write_message(&mut client, b"").await.unwrap();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(harness.subscriber_count("/topic/foo").await, 0);
    }

    #[tokio::test]
    async fn test_truncated_pair_is_missing_payload() {
        let harness = Harness::new();
        let (mut client, task) = harness.connect(1);
        write_message(&mut client, b"/topic/foo").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 1).await;

        write_message(&mut client, b"/topic/foo").await.unwrap();
        drop(client);

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(BrokerError::MissingPayload { ref channel }) if channel == "/topic/foo"
        ));
        assert_eq!(harness.subscriber_count("/topic/foo").await, 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let harness = Harness::new();
        let (mut client, task) = harness.connect(1);
        write_message(&mut client, b"/topic/foo").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 1).await;

        write_message(&mut client, &[b'X'; 2048]).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(BrokerError::MessageRead(CodecError::FrameTooLarge { .. }))
        ));
        assert_eq!(harness.subscriber_count("/topic/foo").await, 0);
    }

    #[tokio::test]
    async fn test_cancel_unwinds_and_unregisters() {
        let harness = Harness::new();
        let (mut client, task) = harness.connect(1);
        write_message(&mut client, b"/topic/foo").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 1).await;

        harness.shutdown.cancel();

        let result = timeout(Duration::from_secs(1), task).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert_eq!(harness.subscriber_count("/topic/foo").await, 0);
        assert!(read_message(&mut client).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_forward_failure_does_not_stop_sender() {
        let harness = Harness::new();
        let (mut live, _t1) = harness.connect(1);
        write_message(&mut live, b"/topic/foo").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 1).await;

        // A registered subscriber whose peer has already gone away.
        let (dead_writer, dead_reader) = tokio::io::duplex(64);
        drop(dead_reader);
        harness.registry.lock().await.register(
            Channel::from("/topic/foo"),
            Subscriber::new(99, "127.0.0.1:9999".parse().unwrap(), dead_writer),
        );

        let (mut sender, sender_task) = harness.connect(2);
        write_message(&mut sender, b"/null").await.unwrap();
        publish(&mut sender, "/topic/foo", b"first").await;
        publish(&mut sender, "/topic/foo", b"second").await;

        assert_eq!(&recv(&mut live).await[..], b"first");
        assert_eq!(&recv(&mut live).await[..], b"second");
        assert!(!sender_task.is_finished());
        assert_eq!(harness.subscriber_count("/topic/foo").await, 2);
        assert!(harness.stats.snapshot().forward_failures >= 1);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_hold_up_others() {
        let harness = Harness::new();
        let (mut live, _t1) = harness.connect(1);
        write_message(&mut live, b"/topic/foo").await.unwrap();
        harness.wait_for_subscribers("/topic/foo", 1).await;

        // Nobody ever reads this end, so writes past 8 bytes never complete.
        let (stalled_writer, _stalled_reader) = tokio::io::duplex(8);
        harness.registry.lock().await.register(
            Channel::from("/topic/foo"),
            Subscriber::new(99, "127.0.0.1:9999".parse().unwrap(), stalled_writer),
        );

        let (mut sender, sender_task) = harness.connect(2);
        write_message(&mut sender, b"/null").await.unwrap();
        let payload = vec![b'X'; 512];
        publish(&mut sender, "/topic/foo", &payload).await;

        assert_eq!(&recv(&mut live).await[..], &payload[..]);
        timeout(Duration::from_secs(1), async {
            while harness.stats.snapshot().deliveries == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!sender_task.is_finished());
        assert_eq!(harness.stats.snapshot().forward_failures, 0);
    }

    #[tokio::test]
    async fn test_scripted_stream_missing_payload() {
        let harness = Harness::new();
        let stream = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 10])
            .read(b"/topic/foo")
            .read(&[0, 0, 0, 10])
            .read(b"/topic/bar")
            .build();
        let handler =
            ConnectionHandler::new(1, "127.0.0.1:10001".parse().unwrap(), stream, harness.ctx());

        let result = handler.run().await;

        assert!(matches!(
            result,
            Err(BrokerError::MissingPayload { ref channel }) if channel == "/topic/bar"
        ));
        assert!(harness.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_stream_read_error() {
        let harness = Harness::new();
        let stream = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 10])
            .read(b"/topic/foo")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            ))
            .build();
        let handler =
            ConnectionHandler::new(1, "127.0.0.1:10001".parse().unwrap(), stream, harness.ctx());

        let result = handler.run().await;

        assert!(matches!(
            result,
            Err(BrokerError::MessageRead(CodecError::Io(_)))
        ));
        assert!(!result.unwrap_err().is_disconnect());
        assert!(harness.registry.lock().await.is_empty());
    }
}
