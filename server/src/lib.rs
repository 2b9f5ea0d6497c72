//! # Channel Broker Server
//!
//! A small publish/subscribe broker over raw TCP. Clients connect, declare
//! the one channel they listen on, and then publish `(channel, payload)`
//! pairs that the broker forwards to that channel's subscribers.
//!
//! ## Delivery
//!
//! ### Broadcast Channels
//! Any channel whose name does not start with the queue prefix. Every
//! current subscriber receives every message, in registration order.
//!
//! ### Work-Queue Channels
//! Channels starting with the queue prefix (`/queue` by default). Each
//! message goes to exactly one subscriber, chosen round-robin, so repeated
//! messages spread across workers instead of duplicating.
//!
//! ### Fire and Forget
//! The broker never answers a publisher. A message for a channel with no
//! subscribers is dropped, and a failed write to one subscriber is logged
//! and counted without affecting the others.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Channel to subscriber mapping and recipient selection, with the
//! per-policy logic in `policy`.
//!
//! ### Handler Module (`handler`)
//! Drives one connection through handshake, relay loop and cleanup.
//!
//! ### Network Module (`network`)
//! Owns the listener and the shared registry, spawns one task per
//! connection and supervises shutdown through `shutdown`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = BrokerServer::start(BrokerConfig::with_addr("127.0.0.1", 25000)).await?;
//!     let shutdown = server.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.cancel();
//!     });
//!
//!     // Returns once every connection has been cleaned up
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod network;
pub mod policy;
pub mod registry;
pub mod shutdown;
pub mod stats;

pub use config::BrokerConfig;
pub use error::BrokerError;
pub use network::BrokerServer;
pub use policy::DeliveryPolicy;
pub use registry::{SharedRegistry, Subscriber, SubscriptionRegistry};
pub use shutdown::{Lifecycle, ShutdownHandle, ShutdownSignal};
pub use stats::{BrokerStats, StatsSnapshot};
