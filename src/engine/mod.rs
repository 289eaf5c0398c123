//! # Engine
//!
//! The tokio side of the server: accept loops, per-connection read loops,
//! writer shards and periodic maintenance, plus the OS-thread worker pool that
//! runs application handlers.
//!
//! ## Flow
//! ```text
//! accept -> SessionManager -> read loop -> decoder -> RequestQueue -> workers -> Dispatcher
//! Response -> PacketWriter -> PacketQueue -> writer shard -> connection sink
//! ```
//!
//! Every loop selects on the engine's [`CancellationToken`]; connection tasks
//! also select on their session's token, so closing a session stops its tasks.

pub mod acceptor;
pub mod kcp;
pub mod reader;
pub mod scheduler;
pub mod worker;
pub mod writer;

use crate::core::decoder::BinaryPacketDecoder;
use crate::session::datagram_policy::DatagramPacketPolicy;
use crate::session::{ChannelId, SessionManager};
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::NetworkStatistics;
use kcp::KcpChannelFactory;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Outbound channel capacity of one stream connection. Anything beyond it
/// waits in the session's packet queue, under the queue policy.
pub const CONNECTION_OUTBOUND_CAPACITY: usize = 32;

/// Outbound channel capacity of a shared UDP socket.
pub const DATAGRAM_OUTBOUND_CAPACITY: usize = 4096;

/// Shared state handed to every engine task.
pub struct EngineContext {
    pub manager: Arc<SessionManager>,
    pub decoder: Arc<BinaryPacketDecoder>,
    pub statistics: Arc<NetworkStatistics>,
    pub datagram_policy: Arc<dyn DatagramPacketPolicy>,
    pub kcp_factory: Option<Arc<dyn KcpChannelFactory>>,
    pub buffers: BufferPool,
    pub cancel: CancellationToken,
    /// Connection and listener tasks, awaited on shutdown
    pub tasks: TaskTracker,
    next_channel: AtomicU64,
}

impl EngineContext {
    pub fn new(
        manager: Arc<SessionManager>,
        decoder: Arc<BinaryPacketDecoder>,
        datagram_policy: Arc<dyn DatagramPacketPolicy>,
        kcp_factory: Option<Arc<dyn KcpChannelFactory>>,
        buffers: BufferPool,
    ) -> Self {
        let statistics = manager.statistics().clone();
        Self {
            manager,
            decoder,
            statistics,
            datagram_policy,
            kcp_factory,
            buffers,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            next_channel: AtomicU64::new(1),
        }
    }

    pub fn next_channel_id(&self) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed))
    }
}
