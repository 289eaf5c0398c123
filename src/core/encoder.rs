//! # Binary Packet Encoder
//!
//! Turns a packet's serialized payload into wire bytes:
//!
//! ```text
//! [header: 1 byte][length: 0, 2 or 4 bytes][payload: length bytes]
//! ```
//!
//! The payload is compressed when it reaches the compression threshold, then
//! encrypted when the packet asks for it. Stream transports get a length field
//! (2 bytes, or 4 with the BIG_SIZE flag once the payload no longer fits an
//! unsigned short). Datagrams are self-delimiting and carry no length field.
//! Multi-byte lengths are big-endian.

use crate::core::header::{encode_first_header_byte, PacketHeader};
use crate::core::packet::Packet;
use crate::core::transform::{BinaryPacketCompressor, BinaryPacketEncryptor, NoopEncryptor};
use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tracing::trace;

/// Payloads above this size need the 4-byte length field.
pub const MAX_BYTES_FOR_NORMAL_SIZE: usize = u16::MAX as usize;

/// Default payload size from which compression kicks in.
pub const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 3000;

pub struct BinaryPacketEncoder {
    compressor: Option<Arc<dyn BinaryPacketCompressor>>,
    encryptor: Arc<dyn BinaryPacketEncryptor>,
    compression_threshold_bytes: usize,
    max_payload_size: usize,
}

impl Default for BinaryPacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryPacketEncoder {
    /// Encoder without compression and with the identity encryptor.
    pub fn new() -> Self {
        Self {
            compressor: None,
            encryptor: Arc::new(NoopEncryptor),
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD_BYTES,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn BinaryPacketCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn BinaryPacketEncryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    /// 0 disables compression regardless of the configured compressor.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold_bytes = bytes;
        self
    }

    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    fn should_compress(&self, len: usize) -> bool {
        self.compressor.is_some()
            && self.compression_threshold_bytes > 0
            && len >= self.compression_threshold_bytes
    }

    /// Frame the packet's payload.
    ///
    /// # Errors
    /// - `EmptyPayload` when the packet has no data
    /// - `CompressionFailure` / `EncryptionFailure` from the strategies
    /// - `OversizedPacket` when the transformed payload exceeds the configured limit
    pub fn encode(&self, packet: Packet) -> Result<Packet> {
        if packet.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }

        let mut payload = packet.data().clone();

        let compressed = self.should_compress(payload.len());
        if compressed {
            if let Some(compressor) = &self.compressor {
                payload = compressor.compress(&payload)?.into();
            }
        }

        let encrypted = packet.needs_encryption();
        if encrypted {
            payload = self.encryptor.encrypt(&payload)?.into();
        }

        if payload.len() > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }

        let counting = packet.needs_counting();
        let big_sized = counting && payload.len() > MAX_BYTES_FOR_NORMAL_SIZE;
        let header = PacketHeader::new(
            counting,
            compressed,
            big_sized,
            encrypted,
            packet.data_type(),
        );

        let mut buffer = BytesMut::with_capacity(1 + header.length_field_size() + payload.len());
        buffer.put_u8(encode_first_header_byte(&header));
        match header.length_field_size() {
            2 => buffer.put_u16(payload.len() as u16),
            4 => buffer.put_u32(payload.len() as u32),
            _ => {}
        }
        buffer.extend_from_slice(&payload);

        trace!(
            payload_bytes = payload.len(),
            framed_bytes = buffer.len(),
            compressed,
            encrypted,
            "Packet encoded"
        );

        Ok(packet.into_framed(buffer.freeze(), header))
    }
}
