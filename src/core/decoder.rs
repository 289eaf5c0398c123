//! # Binary Packet Decoder
//!
//! Reassembles frames from a byte stream that arrives in arbitrary chunks.
//!
//! Each session owns a [`PendingPacket`] recording how far the current frame has
//! been read. Feeding bytes advances it through:
//!
//! ```text
//! WaitNewPacket -> WaitDataSize -> (WaitDataSizeFragment) -> WaitData -> WaitNewPacket
//! ```
//!
//! When a chunk ends before a frame is complete the state stays on the session and
//! the call returns the frames completed so far (possibly none). Completed frames
//! are decrypted, then decompressed, according to their header flags.
//!
//! Errors are not recovered from here. The pending state is reset so the session
//! object stays consistent, but the caller is expected to close the session since
//! the stream position can no longer be trusted.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::data::DataCollection;
use crate::core::header::{decode_first_header_byte, PacketHeader};
use crate::core::transform::{BinaryPacketCompressor, BinaryPacketEncryptor, NoopEncryptor};
use crate::error::{ProtocolError, Result};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::trace;

/// Position of the read-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketReadState {
    #[default]
    WaitNewPacket,
    WaitDataSize,
    WaitDataSizeFragment,
    WaitData,
}

/// Per-session scratch state for a frame being reassembled.
#[derive(Debug, Default)]
pub struct PendingPacket {
    state: PacketReadState,
    header: PacketHeader,
    length_bytes: [u8; 4],
    length_read: usize,
    expected_length: usize,
    buffer: BytesMut,
}

impl PendingPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PacketReadState {
        self.state
    }

    /// Header of the frame in progress, meaningful once past `WaitNewPacket`.
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn expected_length(&self) -> usize {
        self.expected_length
    }

    /// Payload bytes collected so far for the frame in progress.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A complete frame with transforms already undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl DecodedFrame {
    /// Deserialize the payload with the format named in the header.
    pub fn to_collection(&self) -> Result<DataCollection> {
        DataCollection::deserialize(self.header.data_type(), &self.payload)
    }
}

pub struct BinaryPacketDecoder {
    compressor: Option<Arc<dyn BinaryPacketCompressor>>,
    encryptor: Arc<dyn BinaryPacketEncryptor>,
    max_payload_size: usize,
}

impl Default for BinaryPacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryPacketDecoder {
    pub fn new() -> Self {
        Self {
            compressor: None,
            encryptor: Arc::new(NoopEncryptor),
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

    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    /// Feed stream bytes into a session's pending state.
    ///
    /// Returns every frame completed by this chunk, in order. An empty chunk is a
    /// no-op and returns no frames.
    pub fn decode(&self, pending: &mut PendingPacket, data: &[u8]) -> Result<Vec<DecodedFrame>> {
        let result = self.advance(pending, data);
        if result.is_err() {
            pending.reset();
        }
        result
    }

    fn advance(&self, pending: &mut PendingPacket, mut data: &[u8]) -> Result<Vec<DecodedFrame>> {
        let mut frames = Vec::new();

        while !data.is_empty() {
            match pending.state {
                PacketReadState::WaitNewPacket => {
                    let header = decode_first_header_byte(data[0]);
                    if !header.counting {
                        return Err(ProtocolError::InvalidHeader);
                    }
                    pending.header = header;
                    pending.length_read = 0;
                    pending.state = PacketReadState::WaitDataSize;
                    data = &data[1..];
                }
                PacketReadState::WaitDataSize | PacketReadState::WaitDataSizeFragment => {
                    let field_size = pending.header.length_field_size();
                    let take = (field_size - pending.length_read).min(data.len());
                    let start = pending.length_read;
                    pending.length_bytes[start..start + take].copy_from_slice(&data[..take]);
                    pending.length_read += take;
                    data = &data[take..];

                    if pending.length_read < field_size {
                        pending.state = PacketReadState::WaitDataSizeFragment;
                        continue;
                    }

                    let length = self.parse_length(&pending.header, &pending.length_bytes)?;
                    pending.expected_length = length;
                    pending.buffer = BytesMut::with_capacity(length);
                    pending.state = PacketReadState::WaitData;
                }
                PacketReadState::WaitData => {
                    let missing = pending.expected_length - pending.buffer.len();
                    let take = missing.min(data.len());
                    pending.buffer.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if pending.buffer.len() == pending.expected_length {
                        let header = pending.header;
                        let payload = pending.buffer.split().freeze();
                        pending.reset();
                        frames.push(self.finish(header, payload)?);
                    }
                }
            }
        }

        trace!(
            frames = frames.len(),
            state = ?pending.state,
            "Stream chunk decoded"
        );
        Ok(frames)
    }

    /// Decode one self-delimited datagram.
    ///
    /// Returns `Ok(None)` for an empty datagram. A datagram that does carry a
    /// length field must match it exactly.
    pub fn decode_datagram(&self, data: &[u8]) -> Result<Option<DecodedFrame>> {
        let Some((&first, rest)) = data.split_first() else {
            return Ok(None);
        };

        let header = decode_first_header_byte(first);
        let field_size = header.length_field_size();
        let payload = if field_size > 0 {
            if rest.len() < field_size {
                return Err(ProtocolError::InvalidLength(rest.len() as i64));
            }
            let mut length_bytes = [0u8; 4];
            length_bytes[..field_size].copy_from_slice(&rest[..field_size]);
            let length = self.parse_length(&header, &length_bytes)?;
            let body = &rest[field_size..];
            if body.len() != length {
                return Err(ProtocolError::InvalidLength(body.len() as i64));
            }
            body
        } else {
            rest
        };

        if payload.is_empty() {
            return Err(ProtocolError::InvalidLength(0));
        }
        if payload.len() > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }

        self.finish(header, Bytes::copy_from_slice(payload)).map(Some)
    }

    fn parse_length(&self, header: &PacketHeader, bytes: &[u8; 4]) -> Result<usize> {
        let length: i64 = if header.big_sized {
            i32::from_be_bytes(*bytes) as i64
        } else {
            u16::from_be_bytes([bytes[0], bytes[1]]) as i64
        };

        if length <= 0 {
            return Err(ProtocolError::InvalidLength(length));
        }
        let length = length as usize;
        if length > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(length));
        }
        Ok(length)
    }

    fn finish(&self, header: PacketHeader, mut payload: Bytes) -> Result<DecodedFrame> {
        if header.encrypted {
            payload = self.encryptor.decrypt(&payload)?.into();
        }

        if header.compressed {
            let compressor = self
                .compressor
                .as_ref()
                .ok_or(ProtocolError::DecompressionFailure)?;
            payload = compressor.uncompress(&payload)?.into();
        }

        Ok(DecodedFrame { header, payload })
    }
}
