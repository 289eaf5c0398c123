//! # Session Manager
//!
//! Registry of live sessions and the single place where sessions are created
//! and closed.
//!
//! Sessions are indexed by id and by their native handle:
//!
//! | Transport | Key                                   |
//! |-----------|---------------------------------------|
//! | socket    | [`ChannelId`]                         |
//! | websocket | [`ChannelId`]                         |
//! | datagram  | `(remote address, convey id)`, plus convey id alone for rebinding |
//! | kcp       | conversation id                       |
//!
//! All indices live behind one lock, so a close removes a session from every
//! index at once. Duplicate checks and inserts happen under that same lock.
//! Maintenance sweeps iterate a copy-on-write snapshot, rebuilt on the first
//! read after a registration or removal, which lets them run while sessions
//! come and go.

use crate::config::{NetworkConfig, ReconnectionPolicy};
use crate::engine::kcp::KcpChannel;
use crate::error::{ProtocolError, Result};
use crate::protocol::event::{EventSink, ServerEvent};
use crate::session::disconnect::DisconnectCause;
use crate::session::filter::ConnectionFilter;
use crate::session::queue::{DefaultPacketQueuePolicy, PacketQueue, PacketQueuePolicy};
use crate::session::session::{ChannelId, Session, SessionHandle};
use crate::utils::metrics::NetworkStatistics;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Settings applied to every session the manager creates.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub packet_queue_size: usize,
    pub max_idle_time: Duration,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub reconnection: ReconnectionPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            packet_queue_size: config.session.packet_queue_size,
            max_idle_time: config.session.max_idle_time,
            max_connections: config.server.max_connections,
            max_connections_per_ip: config.session.max_connections_per_ip,
            reconnection: config.session.reconnection,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

#[derive(Default)]
struct Indices {
    sessions: HashMap<u64, Arc<Session>>,
    sockets: HashMap<ChannelId, u64>,
    websockets: HashMap<ChannelId, u64>,
    datagrams: HashMap<(SocketAddr, i32), u64>,
    conveys: HashMap<i32, u64>,
    kcps: HashMap<u32, u64>,
    players: HashMap<String, u64>,
    /// Address counted by the connection filter for each session
    admitted: HashMap<u64, IpAddr>,
    live: Arc<Vec<Arc<Session>>>,
    /// `live` is behind `sessions`
    stale: bool,
}

/// Point `key` at `id` unless another session already owns it.
fn claim<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, u64>,
    key: K,
    id: u64,
    describe: impl FnOnce() -> String,
) -> Result<()> {
    if index.contains_key(&key) {
        return Err(ProtocolError::DuplicateSession(describe()));
    }
    index.insert(key, id);
    Ok(())
}

impl Indices {
    fn rebuild_snapshot(&mut self) {
        self.live = Arc::new(self.sessions.values().cloned().collect());
        self.stale = false;
    }

    fn lookup<K: std::hash::Hash + Eq>(&self, index: &HashMap<K, u64>, key: &K) -> Option<Arc<Session>> {
        index.get(key).and_then(|id| self.sessions.get(id)).cloned()
    }

    /// Drop every index entry that points at `session`. Returns the admitted address.
    fn remove(&mut self, session: &Session) -> Option<IpAddr> {
        let id = session.id();
        self.sessions.remove(&id)?;

        fn remove_if_owned<K: std::hash::Hash + Eq>(index: &mut HashMap<K, u64>, key: &K, id: u64) {
            if index.get(key) == Some(&id) {
                index.remove(key);
            }
        }

        match session.handle() {
            SessionHandle::Socket { channel, .. } => remove_if_owned(&mut self.sockets, channel, id),
            SessionHandle::WebSocket { channel, .. } => {
                remove_if_owned(&mut self.websockets, channel, id)
            }
            SessionHandle::Datagram { convey_id, .. } => {
                remove_if_owned(
                    &mut self.datagrams,
                    &(session.remote_address(), *convey_id),
                    id,
                );
                remove_if_owned(&mut self.conveys, convey_id, id);
            }
            SessionHandle::Kcp { channel } => remove_if_owned(&mut self.kcps, &channel.conv(), id),
        }
        if let Some(player) = session.player_name() {
            remove_if_owned(&mut self.players, &player, id);
        }

        self.stale = true;
        self.admitted.remove(&id)
    }
}

pub struct SessionManager {
    indices: RwLock<Indices>,
    next_id: AtomicU64,
    settings: SessionSettings,
    filter: ConnectionFilter,
    queue_policy: Arc<dyn PacketQueuePolicy>,
    events: Arc<dyn EventSink>,
    statistics: Arc<NetworkStatistics>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        events: Arc<dyn EventSink>,
        statistics: Arc<NetworkStatistics>,
    ) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            next_id: AtomicU64::new(1),
            filter: ConnectionFilter::new(settings.max_connections_per_ip),
            settings,
            queue_policy: Arc::new(DefaultPacketQueuePolicy),
            events,
            statistics,
        }
    }

    /// Replace the admission policy of queues created from now on.
    pub fn with_queue_policy(mut self, policy: Arc<dyn PacketQueuePolicy>) -> Self {
        self.queue_policy = policy;
        self
    }

    // Index maps stay consistent even if a holder panicked between statements
    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn filter(&self) -> &ConnectionFilter {
        &self.filter
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }

    fn admit(&self, peer: SocketAddr) -> Result<()> {
        if let Err(e) = self.filter.validate_and_add(peer.ip()) {
            self.statistics.connection_refused();
            let reason = match &e {
                ProtocolError::RefusedConnection { reason, .. } => reason.clone(),
                other => other.to_string(),
            };
            self.events.emit(ServerEvent::ConnectionRefused {
                address: peer,
                reason,
            });
            return Err(e);
        }
        Ok(())
    }

    fn new_session(&self, handle: SessionHandle, peer: SocketAddr) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = PacketQueue::with_policy(self.settings.packet_queue_size, self.queue_policy.clone());
        Arc::new(Session::new(id, handle, peer, queue, self.settings.max_idle_time))
    }

    /// Insert into the indices, announce it, and enforce the global cap.
    ///
    /// `index` claims the transport keys and fails if another session got them
    /// first. The admission taken for the peer is then given back.
    fn register<F>(&self, session: Arc<Session>, index: F) -> Result<Arc<Session>>
    where
        F: FnOnce(&mut Indices, u64) -> Result<()>,
    {
        let id = session.id();
        let over_limit = {
            let mut indices = self.write();
            if let Err(e) = index(&mut indices, id) {
                drop(indices);
                self.filter.release(session.remote_address().ip());
                debug!(session_id = id, error = %e, "Session lost a registration race");
                return Err(e);
            }
            session.activate();
            indices.sessions.insert(id, session.clone());
            indices.admitted.insert(id, session.remote_address().ip());
            indices.stale = true;
            indices.sessions.len() > self.settings.max_connections
        };

        self.statistics.session_opened();
        info!(
            session_id = id,
            transport = %session.transport(),
            peer = %session.remote_address(),
            "Session created"
        );
        self.events.emit(ServerEvent::ChannelActive {
            session: session.clone(),
        });

        if over_limit {
            warn!(
                session_id = id,
                max_connections = self.settings.max_connections,
                "Connection limit reached"
            );
            self.close_session(&session, DisconnectCause::ReachedMaxConnection);
        }
        Ok(session)
    }

    /// Register a raw socket connection.
    ///
    /// Returns `RefusedConnection` when the filter refuses the peer. A session
    /// created beyond the global limit is returned already closed.
    pub fn create_socket_session(
        &self,
        channel: ChannelId,
        peer: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<Arc<Session>> {
        if self.read().sockets.contains_key(&channel) {
            return Err(ProtocolError::DuplicateSession(format!("socket {channel}")));
        }
        self.admit(peer)?;
        let session = self.new_session(SessionHandle::Socket { channel, outbound }, peer);
        self.register(session, |indices, id| {
            claim(&mut indices.sockets, channel, id, || format!("socket {channel}"))
        })
    }

    pub fn create_websocket_session(
        &self,
        channel: ChannelId,
        peer: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<Arc<Session>> {
        if self.read().websockets.contains_key(&channel) {
            return Err(ProtocolError::DuplicateSession(format!("websocket {channel}")));
        }
        self.admit(peer)?;
        let session = self.new_session(SessionHandle::WebSocket { channel, outbound }, peer);
        self.register(session, |indices, id| {
            claim(&mut indices.websockets, channel, id, || format!("websocket {channel}"))
        })
    }

    pub fn create_datagram_session(
        &self,
        convey_id: i32,
        remote: SocketAddr,
        outbound: mpsc::Sender<(SocketAddr, Bytes)>,
    ) -> Result<Arc<Session>> {
        if self.read().conveys.contains_key(&convey_id) {
            return Err(ProtocolError::DuplicateSession(format!("convey id {convey_id}")));
        }
        self.admit(remote)?;
        let session = self.new_session(SessionHandle::Datagram { convey_id, outbound }, remote);
        self.register(session, |indices, id| {
            claim(&mut indices.conveys, convey_id, id, || format!("convey id {convey_id}"))?;
            indices.datagrams.insert((remote, convey_id), id);
            Ok(())
        })
    }

    /// Find or create the session a datagram belongs to.
    ///
    /// A known convey id arriving from a new address moves the session to that
    /// address.
    pub fn resolve_datagram(
        &self,
        convey_id: i32,
        remote: SocketAddr,
        outbound: &mpsc::Sender<(SocketAddr, Bytes)>,
    ) -> Result<Arc<Session>> {
        if let Some(session) = self.get_session_by_datagram(remote, convey_id) {
            return Ok(session);
        }

        {
            let mut indices = self.write();
            if let Some(session) = indices.lookup(&indices.conveys, &convey_id) {
                let previous = session.remote_address();
                indices.datagrams.remove(&(previous, convey_id));
                indices.datagrams.insert((remote, convey_id), session.id());
                session.set_remote_address(remote);
                debug!(
                    session_id = session.id(),
                    convey_id,
                    from = %previous,
                    to = %remote,
                    "Datagram session rebound"
                );
                return Ok(session);
            }
        }

        match self.create_datagram_session(convey_id, remote, outbound.clone()) {
            // Another reader registered this convey id first
            Err(ProtocolError::DuplicateSession(what)) => self
                .get_session_by_convey(convey_id)
                .ok_or(ProtocolError::DuplicateSession(what)),
            other => other,
        }
    }

    pub fn create_kcp_session(&self, channel: Arc<dyn KcpChannel>) -> Result<Arc<Session>> {
        let conv = channel.conv();
        let peer = channel.peer();
        if self.read().kcps.contains_key(&conv) {
            return Err(ProtocolError::DuplicateSession(format!("kcp conv {conv}")));
        }
        self.admit(peer)?;
        let session = self.new_session(SessionHandle::Kcp { channel }, peer);
        self.register(session, |indices, id| {
            claim(&mut indices.kcps, conv, id, || format!("kcp conv {conv}"))
        })
    }

    pub fn get_session_by_id(&self, id: u64) -> Option<Arc<Session>> {
        self.read().sessions.get(&id).cloned()
    }

    pub fn get_session_by_socket(&self, channel: ChannelId) -> Option<Arc<Session>> {
        let indices = self.read();
        indices.lookup(&indices.sockets, &channel)
    }

    pub fn get_session_by_websocket(&self, channel: ChannelId) -> Option<Arc<Session>> {
        let indices = self.read();
        indices.lookup(&indices.websockets, &channel)
    }

    pub fn get_session_by_datagram(&self, remote: SocketAddr, convey_id: i32) -> Option<Arc<Session>> {
        let indices = self.read();
        indices.lookup(&indices.datagrams, &(remote, convey_id))
    }

    pub fn get_session_by_convey(&self, convey_id: i32) -> Option<Arc<Session>> {
        let indices = self.read();
        indices.lookup(&indices.conveys, &convey_id)
    }

    pub fn get_session_by_kcp(&self, conv: u32) -> Option<Arc<Session>> {
        let indices = self.read();
        indices.lookup(&indices.kcps, &conv)
    }

    pub fn get_session_by_player(&self, player_name: &str) -> Option<Arc<Session>> {
        let indices = self.read();
        indices
            .players
            .get(player_name)
            .and_then(|id| indices.sessions.get(id))
            .cloned()
    }

    /// Attach a player identity to a session.
    ///
    /// When the player already holds another session the reconnection policy
    /// decides: `RejectNew` returns `DuplicateSession`, `PreemptOld` closes the
    /// old session with cause RECONNECTION.
    pub fn associate_player(&self, session: &Arc<Session>, player_name: &str) -> Result<()> {
        let id = session.id();
        let previous = {
            let mut indices = self.write();
            if session.is_closed() || !indices.sessions.contains_key(&id) {
                return Err(ProtocolError::SessionClosed(id));
            }

            let previous = indices
                .players
                .get(player_name)
                .filter(|owner| **owner != id)
                .and_then(|owner| indices.sessions.get(owner))
                .cloned();
            if previous.is_some() && self.settings.reconnection == ReconnectionPolicy::RejectNew {
                return Err(ProtocolError::DuplicateSession(player_name.to_string()));
            }

            session.associate(player_name)?;
            indices.players.insert(player_name.to_string(), id);
            previous
        };

        // The index already points at the new session, so closing the old one leaves it alone
        if let Some(previous) = previous {
            info!(
                player = player_name,
                old_session = previous.id(),
                new_session = id,
                "Player reconnected, closing previous session"
            );
            self.close_session(&previous, DisconnectCause::Reconnection);
        }
        Ok(())
    }

    /// Close a session and remove it from every index.
    ///
    /// Idempotent: only the first call has an effect and emits `ChannelInactive`.
    /// Returns whether this call closed the session.
    pub fn close_session(&self, session: &Arc<Session>, cause: DisconnectCause) -> bool {
        if !session.mark_closed() {
            return false;
        }

        let admitted = self.write().remove(session);
        let dropped = session.queue().clear();
        if let Some(address) = admitted {
            self.filter.release(address);
        }

        self.statistics.session_closed(cause);
        info!(
            session_id = session.id(),
            transport = %session.transport(),
            peer = %session.remote_address(),
            %cause,
            dropped_packets = dropped,
            read_bytes = session.read_bytes(),
            written_bytes = session.written_bytes(),
            "Session closed"
        );
        self.events.emit(ServerEvent::ChannelInactive {
            session: session.clone(),
            cause,
        });
        true
    }

    /// Close with the default cause.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        self.close_session(session, DisconnectCause::Default)
    }

    pub fn kick(&self, session: &Arc<Session>) -> bool {
        self.close_session(session, DisconnectCause::Kick)
    }

    /// Ban an address and close its live sessions. Returns how many were closed.
    pub fn ban_address(&self, address: IpAddr) -> usize {
        self.filter.ban(address);
        let closed = self
            .sessions()
            .iter()
            .filter(|s| s.remote_address().ip() == address)
            .filter(|s| self.close_session(s, DisconnectCause::Ban))
            .count();
        warn!(%address, closed, "Address banned");
        closed
    }

    pub fn close_all(&self, cause: DisconnectCause) -> usize {
        self.sessions()
            .iter()
            .filter(|s| self.close_session(s, cause))
            .count()
    }

    /// Snapshot of live sessions, safe to iterate while sessions are added or closed.
    pub fn sessions(&self) -> Arc<Vec<Arc<Session>>> {
        {
            let indices = self.read();
            if !indices.stale {
                return indices.live.clone();
            }
        }
        let mut indices = self.write();
        if indices.stale {
            indices.rebuild_snapshot();
        }
        indices.live.clone()
    }

    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::EventKind;
    use std::sync::{Barrier, Mutex};
    use std::thread;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EventKind>>);

    impl EventSink for Recorder {
        fn emit(&self, event: ServerEvent) {
            if let Ok(mut events) = self.0.lock() {
                events.push(event.kind());
            }
        }
    }

    fn manager_with(settings: SessionSettings) -> (SessionManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let manager = SessionManager::new(settings, recorder.clone(), Arc::new(NetworkStatistics::new()));
        (manager, recorder)
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_socket_lookup_and_removal() {
        let (manager, recorder) = manager_with(SessionSettings::default());
        let (tx, _rx) = mpsc::channel(4);
        let session = manager.create_socket_session(ChannelId(1), peer(5000), tx).unwrap();

        assert!(Arc::ptr_eq(&manager.get_session_by_socket(ChannelId(1)).unwrap(), &session));
        assert_eq!(manager.session_count(), 1);

        assert!(manager.remove_session(&session));
        assert!(!manager.remove_session(&session));
        assert!(manager.get_session_by_socket(ChannelId(1)).is_none());
        assert!(manager.get_session_by_id(session.id()).is_none());
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![EventKind::ChannelActive, EventKind::ChannelInactive]
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_global_cap_closes_new_session() {
        let settings = SessionSettings {
            max_connections: 1,
            ..SessionSettings::default()
        };
        let (manager, _) = manager_with(settings);
        let (tx, _rx) = mpsc::channel(4);

        let first = manager.create_socket_session(ChannelId(1), peer(1), tx.clone()).unwrap();
        let second = manager.create_socket_session(ChannelId(2), peer(2), tx).unwrap();
        assert!(first.is_active());
        assert!(second.is_closed());
        assert_eq!(manager.session_count(), 1);
        assert_eq!(
            manager.statistics().closed_with(DisconnectCause::ReachedMaxConnection),
            1
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_per_ip_refusal_creates_no_session() {
        let settings = SessionSettings {
            max_connections_per_ip: 1,
            ..SessionSettings::default()
        };
        let (manager, recorder) = manager_with(settings);
        let (tx, _rx) = mpsc::channel(4);

        let first = manager.create_socket_session(ChannelId(1), peer(1), tx.clone()).unwrap();
        let refused = manager.create_socket_session(ChannelId(2), peer(2), tx.clone());
        assert!(matches!(refused, Err(ProtocolError::RefusedConnection { .. })));
        assert_eq!(manager.session_count(), 1);
        assert!(recorder.0.lock().unwrap().contains(&EventKind::ConnectionRefused));

        manager.remove_session(&first);
        assert!(manager.create_socket_session(ChannelId(3), peer(3), tx).is_ok());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_datagram_rebinding() {
        let (manager, _) = manager_with(SessionSettings::default());
        let (tx, _rx) = mpsc::channel(4);

        let session = manager.resolve_datagram(7, peer(1000), &tx).unwrap();
        let same = manager.resolve_datagram(7, peer(1000), &tx).unwrap();
        assert_eq!(session.id(), same.id());

        let moved = manager.resolve_datagram(7, peer(2000), &tx).unwrap();
        assert_eq!(moved.id(), session.id());
        assert_eq!(session.remote_address(), peer(2000));
        assert!(manager.get_session_by_datagram(peer(1000), 7).is_none());
        assert!(manager.get_session_by_datagram(peer(2000), 7).is_some());

        manager.remove_session(&session);
        assert!(manager.get_session_by_convey(7).is_none());
        assert!(manager.get_session_by_datagram(peer(2000), 7).is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_reconnection_policies() {
        let (tx, _rx) = mpsc::channel(4);

        let (reject, _) = manager_with(SessionSettings::default());
        let a = reject.create_socket_session(ChannelId(1), peer(1), tx.clone()).unwrap();
        let b = reject.create_socket_session(ChannelId(2), peer(2), tx.clone()).unwrap();
        reject.associate_player(&a, "alice").unwrap();
        assert!(matches!(
            reject.associate_player(&b, "alice"),
            Err(ProtocolError::DuplicateSession(_))
        ));
        assert!(a.is_associated());

        let (preempt, _) = manager_with(SessionSettings {
            reconnection: ReconnectionPolicy::PreemptOld,
            ..SessionSettings::default()
        });
        let a = preempt.create_socket_session(ChannelId(1), peer(1), tx.clone()).unwrap();
        let b = preempt.create_socket_session(ChannelId(2), peer(2), tx).unwrap();
        preempt.associate_player(&a, "alice").unwrap();
        preempt.associate_player(&b, "alice").unwrap();
        assert!(a.is_closed());
        assert_eq!(preempt.get_session_by_player("alice").unwrap().id(), b.id());
        assert_eq!(
            preempt.statistics().closed_with(DisconnectCause::Reconnection),
            1
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_ban_closes_live_sessions() {
        let (manager, _) = manager_with(SessionSettings::default());
        let (tx, _rx) = mpsc::channel(4);
        let session = manager.create_socket_session(ChannelId(1), peer(1), tx.clone()).unwrap();

        assert_eq!(manager.ban_address(peer(1).ip()), 1);
        assert!(session.is_closed());
        assert!(manager.create_socket_session(ChannelId(2), peer(2), tx).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_snapshot_survives_removal() {
        let (manager, _) = manager_with(SessionSettings::default());
        let (tx, _rx) = mpsc::channel(4);
        for channel in 0..5 {
            manager
                .create_socket_session(ChannelId(channel), peer(1), tx.clone())
                .unwrap();
        }

        let snapshot = manager.sessions();
        for session in snapshot.iter() {
            manager.remove_session(session);
        }
        assert_eq!(snapshot.len(), 5);
        assert_eq!(manager.session_count(), 0);
        assert!(manager.sessions().is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_concurrent_association_registers_one_owner() {
        let (manager, _) = manager_with(SessionSettings::default());
        let manager = Arc::new(manager);
        let (tx, _rx) = mpsc::channel(4);
        let sessions: Vec<_> = (0..8)
            .map(|channel| {
                manager
                    .create_socket_session(ChannelId(channel), peer(channel as u16), tx.clone())
                    .unwrap()
            })
            .collect();

        let barrier = Arc::new(Barrier::new(sessions.len()));
        let handles: Vec<_> = sessions
            .iter()
            .cloned()
            .map(|session| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.associate_player(&session, "alice").is_ok()
                })
            })
            .collect();
        let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

        let owner = manager.get_session_by_player("alice").unwrap();
        assert!(owner.is_associated());
        let associated = sessions.iter().filter(|s| s.is_associated()).count();
        assert_eq!(associated, 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_concurrent_first_datagrams_share_one_session() {
        let (manager, _) = manager_with(SessionSettings::default());
        let manager = Arc::new(manager);
        let (tx, _rx) = mpsc::channel(4);

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8u16)
            .map(|port| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.resolve_datagram(42, peer(7000 + port), &tx).unwrap().id()
                })
            })
            .collect();
        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.filter().connection_count(peer(1).ip()), 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_duplicate_channel_is_refused_and_admission_returned() {
        let (manager, _) = manager_with(SessionSettings::default());
        let (tx, _rx) = mpsc::channel(4);
        manager.create_socket_session(ChannelId(1), peer(1), tx.clone()).unwrap();

        let duplicate = manager.create_socket_session(ChannelId(1), peer(2), tx);
        assert!(matches!(duplicate, Err(ProtocolError::DuplicateSession(_))));
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.filter().connection_count(peer(1).ip()), 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_snapshot_is_rebuilt_only_after_changes() {
        let (manager, _) = manager_with(SessionSettings::default());
        let (tx, _rx) = mpsc::channel(4);
        let first = manager.sessions();
        assert!(Arc::ptr_eq(&first, &manager.sessions()));

        let session = manager.create_socket_session(ChannelId(1), peer(1), tx).unwrap();
        let second = manager.sessions();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &manager.sessions()));
        assert_eq!(second[0].id(), session.id());

        manager.kick(&session);
        assert!(manager.sessions().is_empty());
        assert_eq!(second.len(), 1);
    }
}
