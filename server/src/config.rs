//! Broker configuration

use bytes::Bytes;
use shared::{DEFAULT_HOST, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT, QUEUE_PREFIX};

/// Broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// `host:port` to listen on; the host may be a name that needs resolving
    pub bind_addr: String,

    /// Label used in log lines, handy when several brokers share a host
    pub name: String,

    /// Channel names starting with this prefix get work-queue delivery
    pub queue_prefix: Bytes,

    /// Largest frame a client may send
    pub max_frame_len: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            name: "broker".to_string(),
            queue_prefix: Bytes::from_static(QUEUE_PREFIX),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl BrokerConfig {
    /// Create a config listening on `host:port`
    pub fn with_addr(host: &str, port: u16) -> Self {
        Self {
            bind_addr: format!("{}:{}", host, port),
            ..Default::default()
        }
    }

    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn queue_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}
