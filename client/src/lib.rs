//! # Channel Broker Client
//!
//! Thin client for the channel broker, used by the `client` binary and by
//! the end-to-end tests.
//!
//! A connection subscribes to exactly one channel when it opens. Listeners
//! then wait for frames on that channel; publishers usually subscribe to
//! `/null` and only send `(channel, payload)` pairs.
//!
//! ```rust,no_run
//! use client::BrokerClient;
//! use shared::Channel;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut worker = BrokerClient::subscribe("127.0.0.1:25000", "/queue/jobs").await?;
//!     let mut sender = BrokerClient::publisher("127.0.0.1:25000").await?;
//!
//!     sender.publish(&Channel::from("/queue/jobs"), b"job 1").await?;
//!     if let Some(payload) = worker.recv().await? {
//!         println!("got {:?}", payload);
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{client_label, BrokerClient, ClientError};
