//! # KCP Collaborator Interfaces
//!
//! The reliable-UDP control block is not implemented here. The engine drives any
//! implementation through [`KcpChannel`]: raw UDP segments go in through
//! `input`, reassembled messages come out of `recv`, and `update` runs the
//! retransmission timers. Segments the control block wants to send are handed to
//! the [`KcpOutput`] given to the factory, which the datagram socket drains.

use crate::error::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound UDP segments produced by control blocks.
pub type KcpOutput = mpsc::Sender<(SocketAddr, Bytes)>;

/// One KCP control block bound to a peer.
pub trait KcpChannel: Send + Sync {
    fn conv(&self) -> u32;

    fn peer(&self) -> SocketAddr;

    /// Feed one raw UDP segment.
    fn input(&self, segment: &[u8]) -> Result<()>;

    /// Next complete message, `None` when nothing is ready.
    fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Queue a message for reliable delivery.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Advance timers. `now_ms` is a monotonic millisecond clock.
    fn update(&self, now_ms: u32) -> Result<()>;
}

pub trait KcpChannelFactory: Send + Sync {
    fn create(&self, conv: u32, peer: SocketAddr, output: KcpOutput) -> Result<Arc<dyn KcpChannel>>;
}

/// Conversation id from the first four bytes of a segment (little-endian).
pub fn read_conv(segment: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = segment.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}
