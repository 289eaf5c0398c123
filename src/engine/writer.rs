//! # Writer
//!
//! Outbound path, in two halves.
//!
//! [`PacketWriter::write`] runs on the caller's thread: it encodes the packet
//! once, then offers a copy to every recipient's queue. A refusal by the queue
//! drops the packet for that recipient only and is counted as dropped-by-policy
//! or dropped-by-full. Every accepted copy produces a ticket for the session's
//! writer shard.
//!
//! Writer shards are tokio tasks. A ticket makes the shard move packets from the
//! session queue to the connection's outbound channel. Sessions are pinned to a
//! shard by id, so each session's packets leave in queue order.
//!
//! The shard never waits on a connection. When a peer stops reading and its
//! outbound channel fills, the remaining packets stay in the session queue,
//! where the admission policy sees them, and the shard retries that session on
//! a short timer while it keeps serving everyone else.

use crate::core::data::DataType;
use crate::core::encoder::BinaryPacketEncoder;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::response::Response;
use crate::session::{DisconnectCause, Session, SessionHandle, SessionManager};
use crate::utils::metrics::NetworkStatistics;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Per-call outcome of [`PacketWriter::write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub queued: usize,
    pub dropped_by_policy: usize,
    pub dropped_by_full: usize,
    /// Recipients already closed
    pub skipped: usize,
}

impl std::ops::AddAssign for WriteReport {
    fn add_assign(&mut self, other: Self) {
        self.queued += other.queued;
        self.dropped_by_policy += other.dropped_by_policy;
        self.dropped_by_full += other.dropped_by_full;
        self.skipped += other.skipped;
    }
}

pub type WriterTicket = Arc<Session>;

pub struct PacketWriter {
    encoder: Arc<BinaryPacketEncoder>,
    shards: Vec<mpsc::UnboundedSender<WriterTicket>>,
    statistics: Arc<NetworkStatistics>,
    data_type: DataType,
    encrypted: bool,
}

impl PacketWriter {
    /// Build a writer with `shard_count` shards. The receivers go to [`run_writer_shard`].
    pub fn new(
        encoder: Arc<BinaryPacketEncoder>,
        statistics: Arc<NetworkStatistics>,
        shard_count: usize,
    ) -> (Self, Vec<mpsc::UnboundedReceiver<WriterTicket>>) {
        let (shards, receivers) = (0..shard_count.max(1))
            .map(|_| mpsc::unbounded_channel())
            .unzip();
        (
            Self {
                encoder,
                shards,
                statistics,
                data_type: DataType::default(),
                encrypted: false,
            },
            receivers,
        )
    }

    /// Data type used by responses that do not set one.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Whether responses are encrypted unless told otherwise.
    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn encoder(&self) -> &Arc<BinaryPacketEncoder> {
        &self.encoder
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encrypted
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Start a response written through this writer.
    pub fn response(self: &Arc<Self>) -> Response {
        Response::new(self.clone())
    }

    /// Encode `packet` and queue it for each of its recipients.
    ///
    /// # Errors
    /// Encoding errors only. Queue refusals are reported in the [`WriteReport`].
    pub fn write(&self, packet: Packet) -> Result<WriteReport> {
        let packet = self.encoder.encode(packet)?;
        let mut report = WriteReport::default();

        for session in packet.recipients() {
            if session.is_closed() {
                report.skipped += 1;
                continue;
            }

            match session.queue().put(packet.for_queue()) {
                Ok(()) => {
                    report.queued += 1;
                    self.ticket(session);
                }
                Err(ProtocolError::PacketQueueFull) => {
                    report.dropped_by_full += 1;
                    session.record_dropped();
                    self.statistics.packet_dropped_by_full();
                    debug!(session_id = session.id(), "Packet dropped, queue full");
                }
                Err(e) => {
                    report.dropped_by_policy += 1;
                    session.record_dropped();
                    self.statistics.packet_dropped_by_policy();
                    debug!(session_id = session.id(), error = %e, "Packet dropped by queue policy");
                }
            }
        }

        trace!(
            bytes = packet.len(),
            queued = report.queued,
            dropped_by_policy = report.dropped_by_policy,
            dropped_by_full = report.dropped_by_full,
            "Packet written"
        );
        Ok(report)
    }

    fn ticket(&self, session: &Arc<Session>) {
        let shard = (session.id() % self.shards.len() as u64) as usize;
        if self.shards[shard].send(session.clone()).is_err() {
            trace!(session_id = session.id(), shard, "Writer shard stopped");
        }
    }
}

/// How often a shard retries sessions whose connection was backed up.
pub const STALLED_RETRY_INTERVAL: Duration = Duration::from_millis(5);

enum Delivery {
    Sent,
    /// The connection is not accepting more data yet
    Backlogged,
}

fn delivery<T>(session: &Session, result: std::result::Result<(), TrySendError<T>>) -> Result<Delivery> {
    match result {
        Ok(()) => Ok(Delivery::Sent),
        Err(TrySendError::Full(_)) => Ok(Delivery::Backlogged),
        Err(TrySendError::Closed(_)) => Err(ProtocolError::SessionClosed(session.id())),
    }
}

/// Hand framed bytes to the connection behind a session without waiting.
fn try_deliver(session: &Session, bytes: &Bytes) -> Result<Delivery> {
    match session.handle() {
        SessionHandle::Socket { outbound, .. } | SessionHandle::WebSocket { outbound, .. } => {
            delivery(session, outbound.try_send(bytes.clone()))
        }
        SessionHandle::Datagram { outbound, .. } => {
            delivery(session, outbound.try_send((session.remote_address(), bytes.clone())))
        }
        SessionHandle::Kcp { channel } => channel.send(bytes).map(|()| Delivery::Sent),
    }
}

/// Move queued packets to the connection until the queue is empty or the
/// connection backs up. Returns whether packets are still waiting.
fn drain_session(shard: usize, session: &Arc<Session>, manager: &SessionManager) -> bool {
    while !session.is_closed() {
        let Some(packet) = session.queue().peek() else {
            return false;
        };

        match try_deliver(session, packet.data()) {
            Ok(Delivery::Sent) => {
                if session.queue().take().is_some() {
                    let len = packet.len();
                    session.record_written(len);
                    manager.statistics().packet_written(len as u64);
                }
            }
            Ok(Delivery::Backlogged) => {
                trace!(
                    session_id = session.id(),
                    shard,
                    queued = session.queue().len(),
                    "Connection backed up"
                );
                return true;
            }
            Err(e) => {
                manager.statistics().write_error();
                warn!(session_id = session.id(), shard, error = %e, "Write failed");
                manager.close_session(session, DisconnectCause::LostInWritten);
                return false;
            }
        }
    }
    false
}

/// Drain tickets for one shard until cancelled or every writer handle is gone.
pub async fn run_writer_shard(
    shard: usize,
    mut tickets: mpsc::UnboundedReceiver<WriterTicket>,
    manager: Arc<SessionManager>,
    cancel: CancellationToken,
) {
    debug!(shard, "Writer shard started");
    let mut stalled: HashMap<u64, Arc<Session>> = HashMap::new();
    let mut retry = tokio::time::interval(STALLED_RETRY_INTERVAL);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ticket = tickets.recv() => {
                let Some(session) = ticket else { break };
                // A stalled session is drained by the retry timer
                if stalled.contains_key(&session.id()) {
                    continue;
                }
                if drain_session(shard, &session, &manager) {
                    stalled.insert(session.id(), session);
                }
            }
            _ = retry.tick(), if !stalled.is_empty() => {
                stalled.retain(|_, session| drain_session(shard, session, &manager));
            }
        }
    }
    debug!(shard, "Writer shard stopped");
}
