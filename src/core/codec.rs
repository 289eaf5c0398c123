//! # Stream Codec
//!
//! tokio-util adapter over the binary packet codec, for `Framed` streams.
//!
//! The encoder side writes bytes that [`BinaryPacketEncoder`](crate::core::encoder::BinaryPacketEncoder)
//! already framed, so the writer tasks can push queued packets straight into a
//! `FramedWrite`. The decoder side feeds everything it receives into the same
//! read-state machine the server uses, which makes it usable from clients and tests.

use crate::core::decoder::{BinaryPacketDecoder, DecodedFrame, PendingPacket};
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

pub struct PacketCodec {
    decoder: Arc<BinaryPacketDecoder>,
    pending: PendingPacket,
    ready: VecDeque<DecodedFrame>,
}

impl PacketCodec {
    pub fn new(decoder: Arc<BinaryPacketDecoder>) -> Self {
        Self {
            decoder,
            pending: PendingPacket::new(),
            ready: VecDeque::new(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(Arc::new(BinaryPacketDecoder::new()))
    }
}

impl Decoder for PacketCodec {
    type Item = DecodedFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.ready.pop_front() {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        // The state machine keeps partial frames itself, so the whole buffer is consumed
        let chunk = src.split();
        let frames = self.decoder.decode(&mut self.pending, &chunk)?;
        self.ready.extend(frames);
        Ok(self.ready.pop_front())
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::encoder::BinaryPacketEncoder;
    use crate::core::packet::{Packet, TransportType};

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_codec_yields_buffered_frames_one_by_one() {
        let encoder = BinaryPacketEncoder::new();
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        for payload in [vec![1u8], vec![2u8, 2], vec![3u8, 3, 3]] {
            let packet = encoder.encode(Packet::new(payload, TransportType::Socket)).unwrap();
            codec.encode(packet.data().clone(), &mut buf).unwrap();
        }

        let mut lengths = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            lengths.push(frame.payload.len());
        }
        assert_eq!(lengths, vec![1, 2, 3]);
        assert!(buf.is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_codec_waits_for_rest_of_frame() {
        let packet = BinaryPacketEncoder::new()
            .encode(Packet::new(vec![7u8; 20], TransportType::Socket))
            .unwrap();
        let bytes = packet.data();
        let mut codec = PacketCodec::default();

        let mut first = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut first).unwrap().is_none());

        let mut second = BytesMut::from(&bytes[5..]);
        let frame = codec.decode(&mut second).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), &[7u8; 20]);
    }
}
