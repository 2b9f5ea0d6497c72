use bytes::Bytes;
use log::{debug, info};
use rand::Rng;
use shared::{read_message, write_message, Channel, CodecError, NULL_CHANNEL};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Random 8 hex digit label for log lines and generated payloads
pub fn client_label() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// One connection to a broker, subscribed to a single channel
pub struct BrokerClient {
    stream: TcpStream,
    channel: Channel,
    local_addr: Option<SocketAddr>,
}

impl BrokerClient {
    /// Connects and declares `channel` as this connection's subscription.
    pub async fn subscribe(addr: &str, channel: impl Into<Channel>) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let channel = channel.into();
        let local_addr = stream.local_addr().ok();

        write_message(&mut stream, channel.as_bytes()).await?;
        info!("Connected to {} as {:?}, listening on {}", addr, local_addr, channel);

        Ok(Self {
            stream,
            channel,
            local_addr,
        })
    }

    /// Connects without listening to anything real, for publish-only use.
    pub async fn publisher(addr: &str) -> Result<Self, ClientError> {
        Self::subscribe(addr, Channel::new(Bytes::from_static(NULL_CHANNEL))).await
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Sends `payload` to `channel`. The broker never replies.
    pub async fn publish(&mut self, channel: &Channel, payload: &[u8]) -> Result<(), ClientError> {
        write_message(&mut self.stream, channel.as_bytes()).await?;
        write_message(&mut self.stream, payload).await?;
        debug!("Published {} bytes to {}", payload.len(), channel);
        Ok(())
    }

    /// Waits for the next message on the subscribed channel.
    ///
    /// `Ok(None)` means the broker closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ClientError> {
        match read_message(&mut self.stream).await {
            Ok(payload) => Ok(Some(payload)),
            Err(CodecError::Closed) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ends the session the way the broker expects: an empty channel frame.
    pub async fn close(mut self) -> Result<(), ClientError> {
        write_message(&mut self.stream, b"").await?;
        self.stream.shutdown().await.map_err(CodecError::from)?;
        Ok(())
    }
}
