use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::config::TransportConfig;
use crate::core::codec::PacketCodec;
use crate::core::data::{DataCollection, DataType};
use crate::core::encoder::BinaryPacketEncoder;
use crate::core::packet::{Packet, TransportType};
use crate::error::{ProtocolError, Result};

/// Raw socket client speaking the server's packet format
///
/// Used by tools and tests to drive a server over TCP. Outbound packets go
/// through the same encoder as the server's; inbound bytes through the same
/// read-state machine.
pub struct SocketClient {
    framed: Framed<TcpStream, PacketCodec>,
    encoder: BinaryPacketEncoder,
    data_type: DataType,
    encrypted: bool,
}

impl SocketClient {
    /// Connect with the transform settings of `transport`
    #[instrument(skip(addr, transport))]
    pub async fn connect<A: ToSocketAddrs>(addr: A, transport: &TransportConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "Connected");

        let codec = PacketCodec::new(Arc::new(transport.decoder()?));
        Ok(Self {
            framed: Framed::new(stream, codec),
            encoder: transport.encoder()?,
            data_type: transport.data_type,
            encrypted: transport.encryption_enabled(),
        })
    }

    /// Serialize, frame and send one message
    pub async fn send(&mut self, message: &DataCollection) -> Result<()> {
        let payload = message.serialize(self.data_type)?;
        self.send_raw(payload).await
    }

    /// Frame and send an already serialized payload
    pub async fn send_raw(&mut self, payload: Vec<u8>) -> Result<()> {
        let packet = Packet::new(payload, TransportType::Socket)
            .with_data_type(self.data_type)
            .with_encryption(self.encrypted);
        let packet = self.encoder.encode(packet)?;
        self.framed.send(packet.data().clone()).await
    }

    /// Write bytes as they are, bypassing the encoder
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.framed
            .send(bytes::Bytes::copy_from_slice(bytes))
            .await
    }

    /// Receive the next message
    pub async fn receive(&mut self) -> Result<DataCollection> {
        match self.framed.next().await {
            Some(Ok(frame)) => frame.to_collection(),
            Some(Err(e)) => Err(e),
            None => Err(ProtocolError::Custom("Connection closed".to_string())),
        }
    }

    /// Receive the next message, giving up after `timeout`
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<DataCollection> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| ProtocolError::Custom("Receive timed out".to_string()))?
    }

    /// Send a message and wait for the next one
    pub async fn request(&mut self, message: &DataCollection) -> Result<DataCollection> {
        self.send(message).await?;
        self.receive().await
    }

    /// Whether the server has closed the connection, waiting up to `timeout`
    pub async fn is_closed_by_peer(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.framed.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        )
    }
}
