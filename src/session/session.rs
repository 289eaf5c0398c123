//! # Session
//!
//! Server-side handle for one logical client connection, whatever the transport.
//!
//! A session owns its outbound [`PacketQueue`] and the [`PendingPacket`] of the
//! stream decoder, and keeps per-session traffic counters. Its state only moves
//! forward:
//!
//! ```text
//! Created -> Active -> (Associated) -> Closed
//! ```
//!
//! Closing is idempotent. The session manager performs the actual cleanup, the
//! session only records that it happened and cancels its connection tasks.

use crate::core::decoder::{BinaryPacketDecoder, DecodedFrame, PendingPacket};
use crate::core::packet::TransportType;
use crate::engine::kcp::KcpChannel;
use crate::error::constants::ERR_NOT_ACTIVE;
use crate::error::{ProtocolError, Result};
use crate::session::queue::PacketQueue;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifier of an accepted stream connection (socket or websocket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Native handle of the transport behind a session.
#[derive(Clone)]
pub enum SessionHandle {
    Socket {
        channel: ChannelId,
        outbound: mpsc::Sender<Bytes>,
    },
    WebSocket {
        channel: ChannelId,
        outbound: mpsc::Sender<Bytes>,
    },
    /// Many datagram sessions share one socket, told apart by convey id.
    Datagram {
        convey_id: i32,
        outbound: mpsc::Sender<(SocketAddr, Bytes)>,
    },
    Kcp {
        channel: Arc<dyn KcpChannel>,
    },
}

impl SessionHandle {
    pub fn transport(&self) -> TransportType {
        match self {
            SessionHandle::Socket { .. } => TransportType::Socket,
            SessionHandle::WebSocket { .. } => TransportType::WebSocket,
            SessionHandle::Datagram { .. } => TransportType::Datagram,
            SessionHandle::Kcp { .. } => TransportType::Kcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Active = 1,
    Associated = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Active,
            2 => SessionState::Associated,
            _ => SessionState::Closed,
        }
    }
}

pub struct Session {
    id: u64,
    handle: SessionHandle,
    remote_address: RwLock<SocketAddr>,
    state: AtomicU8,
    player_name: Mutex<Option<String>>,
    pending: Mutex<PendingPacket>,
    queue: PacketQueue,
    created_at: Instant,
    /// Milliseconds since `created_at`
    last_activity_ms: AtomicU64,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    dropped_packets: AtomicU64,
    max_idle_time: Duration,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: u64,
        handle: SessionHandle,
        remote_address: SocketAddr,
        queue: PacketQueue,
        max_idle_time: Duration,
    ) -> Self {
        Self {
            id,
            handle,
            remote_address: RwLock::new(remote_address),
            state: AtomicU8::new(SessionState::Created as u8),
            player_name: Mutex::new(None),
            pending: Mutex::new(PendingPacket::new()),
            queue,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            max_idle_time,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> TransportType {
        self.handle.transport()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        match &self.handle {
            SessionHandle::Socket { channel, .. } | SessionHandle::WebSocket { channel, .. } => {
                Some(*channel)
            }
            _ => None,
        }
    }

    pub fn convey_id(&self) -> Option<i32> {
        match &self.handle {
            SessionHandle::Datagram { convey_id, .. } => Some(*convey_id),
            _ => None,
        }
    }

    pub fn kcp_conv(&self) -> Option<u32> {
        match &self.handle {
            SessionHandle::Kcp { channel } => Some(channel.conv()),
            _ => None,
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        *self
            .remote_address
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Datagram peers may move to a new address (NAT rebinding).
    pub(crate) fn set_remote_address(&self, address: SocketAddr) {
        *self
            .remote_address
            .write()
            .unwrap_or_else(|e| e.into_inner()) = address;
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), SessionState::Active | SessionState::Associated)
    }

    pub fn is_associated(&self) -> bool {
        self.state() == SessionState::Associated
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Created -> Active. Returns false if the session was not freshly created.
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Created as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Active -> Associated, recording the player identity.
    pub(crate) fn associate(&self, player_name: &str) -> Result<()> {
        self.state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Associated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ProtocolError::IllegalState(ERR_NOT_ACTIVE.to_string()))?;
        *self.player_name.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(player_name.to_string());
        Ok(())
    }

    /// Move to Closed. Returns true only for the call that performed the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        let previous = self
            .state
            .swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous == SessionState::Closed as u8 {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn player_name(&self) -> Option<String> {
        self.player_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    /// Run stream bytes through this session's read-state machine.
    pub fn decode(&self, decoder: &BinaryPacketDecoder, data: &[u8]) -> Result<Vec<DecodedFrame>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        decoder.decode(&mut pending, data)
    }

    /// Token cancelled when the session closes. Connection tasks select on it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: usize) {
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_written(&self, bytes: usize) {
        self.written_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the last read or write (or creation).
    pub fn inactive_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    /// Idle detection is off when the max idle time is zero.
    pub fn is_idle(&self) -> bool {
        !self.max_idle_time.is_zero() && self.inactive_for() > self.max_idle_time
    }

    /// Still not associated to a player after `allowance`.
    pub fn is_orphan(&self, allowance: Duration) -> bool {
        self.state() == SessionState::Active && self.created_at.elapsed() > allowance
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport())
            .field("remote_address", &self.remote_address())
            .field("state", &self.state())
            .field("player_name", &self.player_name())
            .field("queued", &self.queue.len())
            .finish()
    }
}
