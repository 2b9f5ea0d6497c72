//! Broker network layer: listening socket, accept loop and handler supervision

use log::{debug, error, info};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::handler::{ConnectionHandler, HandlerContext};
use crate::registry::{SharedRegistry, SubscriptionRegistry};
use crate::shutdown::ShutdownHandle;
use crate::stats::BrokerStats;

/// Pub/sub broker owning one listener and one subscription registry
pub struct BrokerServer {
    config: BrokerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: SharedRegistry,
    stats: Arc<BrokerStats>,
    shutdown: ShutdownHandle,
    next_connection_id: AtomicU64,
}

impl BrokerServer {
    /// Binds the listening socket described by `config`.
    ///
    /// Fails with [`BrokerError::Bind`] when the address is in use, not
    /// permitted or cannot be resolved.
    pub async fn start(config: BrokerConfig) -> Result<Self, BrokerError> {
        let bind_error = |source: io::Error| BrokerError::Bind {
            addr: config.bind_addr.clone(),
            source,
        };

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!("Broker '{}' listening on {}", config.name, local_addr);

        Ok(BrokerServer {
            registry: SubscriptionRegistry::shared(config.queue_prefix.clone()),
            config,
            listener,
            local_addr,
            stats: Arc::new(BrokerStats::new()),
            shutdown: ShutdownHandle::new(),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Address actually bound, useful when the configured port was 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<BrokerStats> {
        &self.stats
    }

    /// Handle for stopping or cancelling this server from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts connections until stopped, then waits for every handler to finish.
    pub async fn run(self) {
        let mut stopped = self.shutdown.signal();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = stopped.stopped() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => self.spawn_handler(&mut handlers, socket, peer_addr),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
        }

        let BrokerServer {
            config,
            listener,
            stats,
            ..
        } = self;
        drop(listener);
        info!(
            "Broker '{}' stopped accepting, waiting for {} connection(s)",
            config.name,
            handlers.len()
        );

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                error!("Connection task panicked: {}", e);
            }
        }

        let snapshot = stats.snapshot();
        info!(
            "Broker '{}' shut down: {} connections, {} messages, {} deliveries, {} dropped, {} failed forwards",
            config.name,
            snapshot.connections_accepted,
            snapshot.messages_received,
            snapshot.deliveries,
            snapshot.dropped,
            snapshot.forward_failures
        );
    }

    fn spawn_handler(&self, handlers: &mut JoinSet<()>, socket: TcpStream, peer_addr: SocketAddr) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.stats.record_connection();
        debug!("Conn {}: accepted from {}", id, peer_addr);

        if let Err(e) = socket.set_nodelay(true) {
            debug!("Conn {}: failed to set TCP_NODELAY: {}", id, e);
        }

        let ctx = HandlerContext {
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.signal(),
            max_frame_len: self.config.max_frame_len,
        };

        handlers.spawn(async move {
            let handler = ConnectionHandler::new(id, peer_addr, socket, ctx);
            match handler.run().await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => debug!("Conn {}: {}", id, e),
                Err(e) => error!("Conn {}: {}", id, e),
            }
        });
    }
}
