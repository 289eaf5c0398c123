//! # Network Service
//!
//! Assembles the engine from a [`NetworkConfig`] and owns its lifecycle.
//!
//! ```rust,no_run
//! use gamewire::config::NetworkConfig;
//! use gamewire::protocol::EventKind;
//! use gamewire::service::NetworkService;
//!
//! # async fn run() -> gamewire::error::Result<()> {
//! let mut service = NetworkService::new(NetworkConfig::default())?;
//! let writer = service.writer().clone();
//! service.dispatcher().register(EventKind::SessionRead, move |event| {
//!     if let gamewire::protocol::ServerEvent::SessionRead { session, message } = event {
//!         writer.response().set_message(message)?.set_recipient(session.clone()).write()?;
//!     }
//!     Ok(())
//! })?;
//! service.run_until_ctrl_c().await
//! # }
//! ```
//!
//! All components are built in [`NetworkService::new`] so handlers can be
//! registered before any port is bound. [`NetworkService::start`] binds every
//! configured port and spawns the engine tasks.

use crate::config::NetworkConfig;
use crate::core::decoder::BinaryPacketDecoder;
use crate::core::packet::TransportType;
use crate::engine::acceptor::{accept_sockets, accept_websockets};
use crate::engine::kcp::KcpChannelFactory;
use crate::engine::reader::{read_datagram_socket, read_kcp_socket, send_datagrams};
use crate::engine::scheduler::{kcp_update_loop, session_sweep_loop, statistics_loop};
use crate::engine::worker::WorkerPool;
use crate::engine::writer::{run_writer_shard, PacketWriter, WriterTicket};
use crate::engine::{EngineContext, DATAGRAM_OUTBOUND_CAPACITY};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::request::RequestQueue;
use crate::session::datagram_policy::{DatagramPacketPolicy, DefaultDatagramPacketPolicy};
use crate::session::{DisconnectCause, SessionManager, SessionSettings};
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::NetworkStatistics;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Idle read buffers kept for reuse.
const READ_BUFFER_POOL_SIZE: usize = 64;

struct Running {
    ctx: Arc<EngineContext>,
    workers: WorkerPool,
    addresses: Vec<(TransportType, SocketAddr)>,
}

pub struct NetworkService {
    config: NetworkConfig,
    statistics: Arc<NetworkStatistics>,
    requests: Arc<RequestQueue>,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<SessionManager>,
    decoder: Arc<BinaryPacketDecoder>,
    writer: Arc<PacketWriter>,
    writer_shards: Vec<mpsc::UnboundedReceiver<WriterTicket>>,
    datagram_policy: Arc<dyn DatagramPacketPolicy>,
    kcp_factory: Option<Arc<dyn KcpChannelFactory>>,
    running: Option<Running>,
}

impl NetworkService {
    /// Validate `config` and build every component.
    ///
    /// # Errors
    /// `ConfigError` listing every validation problem.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate_strict()?;

        let statistics = Arc::new(NetworkStatistics::new());
        let requests = Arc::new(RequestQueue::new(
            config.server.request_queue_size,
            statistics.clone(),
        ));
        let manager = Arc::new(SessionManager::new(
            SessionSettings::from_config(&config),
            requests.clone(),
            statistics.clone(),
        ));

        let (writer, writer_shards) = PacketWriter::new(
            Arc::new(config.transport.encoder()?),
            statistics.clone(),
            config.server.writer_workers,
        );
        let writer = writer
            .with_data_type(config.transport.data_type)
            .with_encryption(config.transport.encryption_enabled());

        Ok(Self {
            decoder: Arc::new(config.transport.decoder()?),
            statistics,
            requests,
            dispatcher: Arc::new(Dispatcher::new()),
            manager,
            writer: Arc::new(writer),
            writer_shards,
            datagram_policy: Arc::new(DefaultDatagramPacketPolicy),
            kcp_factory: None,
            running: None,
            config,
        })
    }

    /// Control block factory for the KCP ports. Required when any are configured.
    pub fn with_kcp_factory(mut self, factory: Arc<dyn KcpChannelFactory>) -> Self {
        self.kcp_factory = Some(factory);
        self
    }

    pub fn with_datagram_policy(mut self, policy: Arc<dyn DatagramPacketPolicy>) -> Self {
        self.datagram_policy = policy;
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn writer(&self) -> &Arc<PacketWriter> {
        &self.writer
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound addresses of one transport. Empty before `start`.
    pub fn local_addresses(&self, transport: TransportType) -> Vec<SocketAddr> {
        self.running
            .iter()
            .flat_map(|running| running.addresses.iter())
            .filter(|(kind, _)| *kind == transport)
            .map(|(_, address)| *address)
            .collect()
    }

    /// Bind every configured port and start the engine.
    ///
    /// # Errors
    /// `IllegalState` when already started, `ConfigError` for KCP ports without
    /// a factory, `Io` when a port cannot be bound.
    #[instrument(skip(self), fields(address = %self.config.server.address))]
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() || self.writer_shards.is_empty() {
            return Err(ProtocolError::IllegalState(
                "Network service can only be started once".to_string(),
            ));
        }
        let server = &self.config.server;
        if !server.kcp_ports.is_empty() && self.kcp_factory.is_none() {
            return Err(ProtocolError::ConfigError(
                "KCP ports are configured but no KCP channel factory was provided".to_string(),
            ));
        }
        let ip: IpAddr = server
            .address
            .parse()
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid server address: {}", server.address)))?;

        let ctx = Arc::new(EngineContext::new(
            self.manager.clone(),
            self.decoder.clone(),
            self.datagram_policy.clone(),
            self.kcp_factory.clone(),
            BufferPool::new(READ_BUFFER_POOL_SIZE, server.reader_buffer_size),
        ));

        // Bind everything before spawning so a failed bind leaves nothing running
        let mut sockets = Vec::new();
        for port in &server.socket_ports {
            sockets.push(TcpListener::bind((ip, *port)).await?);
        }
        let mut websockets = Vec::new();
        for port in &server.websocket_ports {
            websockets.push(TcpListener::bind((ip, *port)).await?);
        }
        let mut datagrams = Vec::new();
        for port in &server.datagram_ports {
            datagrams.push(Arc::new(UdpSocket::bind((ip, *port)).await?));
        }
        let mut kcps = Vec::new();
        for port in &server.kcp_ports {
            kcps.push(Arc::new(UdpSocket::bind((ip, *port)).await?));
        }

        let workers = WorkerPool::start(
            server.handler_workers,
            self.requests.clone(),
            self.dispatcher.clone(),
        )?;

        let mut addresses = Vec::new();
        for listener in sockets {
            addresses.push((TransportType::Socket, listener.local_addr()?));
            ctx.tasks.spawn(accept_sockets(ctx.clone(), listener));
        }
        for listener in websockets {
            addresses.push((TransportType::WebSocket, listener.local_addr()?));
            ctx.tasks.spawn(accept_websockets(ctx.clone(), listener));
        }
        for socket in datagrams {
            addresses.push((TransportType::Datagram, socket.local_addr()?));
            let (outbound, rx) = mpsc::channel(DATAGRAM_OUTBOUND_CAPACITY);
            ctx.tasks.spawn(send_datagrams(ctx.clone(), socket.clone(), rx));
            ctx.tasks.spawn(read_datagram_socket(ctx.clone(), socket, outbound));
        }
        for socket in kcps {
            addresses.push((TransportType::Kcp, socket.local_addr()?));
            let (outbound, rx) = mpsc::channel(DATAGRAM_OUTBOUND_CAPACITY);
            ctx.tasks.spawn(send_datagrams(ctx.clone(), socket.clone(), rx));
            ctx.tasks.spawn(read_kcp_socket(ctx.clone(), socket, outbound));
        }

        for (shard, tickets) in std::mem::take(&mut self.writer_shards).into_iter().enumerate() {
            ctx.tasks.spawn(run_writer_shard(
                shard,
                tickets,
                self.manager.clone(),
                ctx.cancel.clone(),
            ));
        }

        let session = &self.config.session;
        ctx.tasks.spawn(session_sweep_loop(
            self.manager.clone(),
            session.idle_check_interval,
            session.orphan_allowance,
            ctx.cancel.clone(),
        ));
        if !server.kcp_ports.is_empty() {
            ctx.tasks.spawn(kcp_update_loop(
                self.manager.clone(),
                session.kcp_update_interval,
                ctx.tasks.clone(),
                ctx.cancel.clone(),
            ));
        }
        if !session.statistics_interval.is_zero() {
            ctx.tasks.spawn(statistics_loop(
                self.statistics.clone(),
                session.statistics_interval,
                ctx.cancel.clone(),
            ));
        }

        for (transport, address) in &addresses {
            info!(transport = %transport, address = %address, "Listening");
        }
        self.running = Some(Running {
            ctx,
            workers,
            addresses,
        });
        Ok(())
    }

    /// Close every session with `ServerDown`, stop the engine and join the handler threads.
    ///
    /// Waits up to the configured shutdown timeout for connection tasks to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!("Shutting down network service");

        let closed = self.manager.close_all(DisconnectCause::ServerDown);
        running.ctx.cancel.cancel();
        running.ctx.tasks.close();

        let timeout = self.config.server.shutdown_timeout;
        if tokio::time::timeout(timeout, running.ctx.tasks.wait()).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Shutdown timeout reached, forcing exit");
        }

        let workers = running.workers;
        tokio::task::spawn_blocking(move || workers.shutdown())
            .await
            .map_err(|e| ProtocolError::Custom(format!("Handler worker shutdown failed: {e}")))?;

        self.statistics.log_statistics();
        info!(sessions_closed = closed, "Network service stopped");
        Ok(())
    }

    /// Start, serve until CTRL+C, then shut down.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Received CTRL+C signal, shutting down");
        self.shutdown().await
    }
}

impl Drop for NetworkService {
    fn drop(&mut self) {
        // Best effort when dropped without shutdown: stop tasks, release handler threads
        if let Some(running) = self.running.take() {
            running.ctx.cancel.cancel();
            self.requests.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfig {
        NetworkConfig::default_with_overrides(|c| {
            c.server.socket_ports = vec![0];
            c.server.handler_workers = 1;
        })
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = NetworkConfig::default_with_overrides(|c| c.server.socket_ports.clear());
        assert!(matches!(NetworkService::new(config), Err(ProtocolError::ConfigError(_))));
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn test_start_binds_and_shutdown_stops() {
        let mut service = NetworkService::new(config()).unwrap();
        assert!(service.local_addresses(TransportType::Socket).is_empty());

        service.start().await.unwrap();
        let addresses = service.local_addresses(TransportType::Socket);
        assert_eq!(addresses.len(), 1);
        assert_ne!(addresses[0].port(), 0);
        assert!(service.start().await.is_err());

        service.shutdown().await.unwrap();
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_kcp_ports_need_a_factory() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.socket_ports.clear();
            c.server.kcp_ports = vec![0];
        });
        let Ok(mut service) = NetworkService::new(config) else {
            panic!("config should be valid");
        };
        assert!(matches!(service.start().await, Err(ProtocolError::ConfigError(_))));
    }
}
