//! Packet queue admission, session registry and connection filter behaviour.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use gamewire::config::ReconnectionPolicy;
use gamewire::core::packet::{Packet, ResponsePriority, TransportType};
use gamewire::error::ProtocolError;
use gamewire::protocol::{EventKind, EventSink, ServerEvent};
use gamewire::session::{ChannelId, DisconnectCause, PacketQueue, SessionManager, SessionSettings};
use gamewire::utils::metrics::NetworkStatistics;
use proptest::prelude::*;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

fn packet(tag: u8, priority: ResponsePriority) -> Packet {
    Packet::new(vec![tag], TransportType::Socket).with_priority(priority)
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(EventKind, Option<DisconnectCause>)>>);

impl EventSink for Recorder {
    fn emit(&self, event: ServerEvent) {
        let cause = match &event {
            ServerEvent::ChannelInactive { cause, .. } => Some(*cause),
            _ => None,
        };
        self.0.lock().unwrap().push((event.kind(), cause));
    }
}

impl Recorder {
    fn causes(&self) -> Vec<DisconnectCause> {
        self.0.lock().unwrap().iter().filter_map(|(_, cause)| *cause).collect()
    }

    fn count(&self, kind: EventKind) -> usize {
        self.0.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }
}

fn manager_with(settings: SessionSettings) -> (SessionManager, Arc<Recorder>) {
    let events = Arc::new(Recorder::default());
    let manager = SessionManager::new(settings, events.clone(), Arc::new(NetworkStatistics::new()));
    (manager, events)
}

fn manager() -> (SessionManager, Arc<Recorder>) {
    manager_with(SessionSettings::default())
}

fn peer(last: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], port))
}

proptest! {
    #[test]
    fn prop_accepted_packets_leave_in_order(tags in prop::collection::vec(any::<u8>(), 0..64)) {
        let queue = PacketQueue::new(64);
        for tag in &tags {
            queue.put(packet(*tag, ResponsePriority::GuaranteedQuickest)).unwrap();
        }
        let taken: Vec<u8> = std::iter::from_fn(|| queue.take()).map(|p| p.data()[0]).collect();
        prop_assert_eq!(taken, tags);
    }
}

#[test]
fn test_policy_boundary_at_75_percent() {
    let queue = PacketQueue::new(100);
    for i in 0..75 {
        queue.put(packet(i, ResponsePriority::NonGuaranteed)).unwrap();
    }
    assert_eq!(queue.percentage_used(), 75.0);

    assert!(matches!(
        queue.put(packet(0, ResponsePriority::NonGuaranteed)),
        Err(ProtocolError::PacketQueuePolicyViolation { .. })
    ));
    queue.put(packet(0, ResponsePriority::Normal)).unwrap();
}

#[test]
fn test_policy_boundary_at_90_percent() {
    let queue = PacketQueue::new(10);
    for i in 0..9 {
        queue.put(packet(i, ResponsePriority::Normal)).unwrap();
    }
    assert_eq!(queue.percentage_used(), 90.0);

    assert!(queue.put(packet(0, ResponsePriority::Normal)).is_err());
    queue.put(packet(0, ResponsePriority::Guaranteed)).unwrap();
    assert!(queue.is_full());
}

#[test]
fn test_full_queue_refuses_top_priority() {
    let queue = PacketQueue::new(2);
    queue.put(packet(1, ResponsePriority::GuaranteedQuickest)).unwrap();
    queue.put(packet(2, ResponsePriority::GuaranteedQuickest)).unwrap();
    assert!(matches!(
        queue.put(packet(3, ResponsePriority::GuaranteedQuickest)),
        Err(ProtocolError::PacketQueueFull)
    ));

    assert_eq!(queue.peek().unwrap().data()[0], 1);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.clear(), 2);
    assert!(queue.is_empty());
}

#[test]
fn test_zero_sized_queue_reports_zero_usage() {
    let queue = PacketQueue::new(0);
    assert_eq!(queue.percentage_used(), 0.0);
    assert!(matches!(
        queue.put(packet(1, ResponsePriority::GuaranteedQuickest)),
        Err(ProtocolError::PacketQueueFull)
    ));
}

#[test]
fn test_low_priority_refused_at_80_percent_guaranteed_accepted() {
    let queue = PacketQueue::new(10);
    for i in 0..8 {
        queue.put(packet(i, ResponsePriority::Normal)).unwrap();
    }
    assert_eq!(queue.percentage_used(), 80.0);

    assert!(queue.put(packet(9, ResponsePriority::NonGuaranteed)).is_err());
    queue.put(packet(9, ResponsePriority::Guaranteed)).unwrap();
    assert_eq!(queue.len(), 9);
}

#[test]
fn test_concurrent_producers_keep_per_producer_order() {
    let queue = Arc::new(PacketQueue::new(4000));
    let producers: Vec<_> = (0..4u8)
        .map(|producer| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..200u16 {
                    let mut data = vec![producer];
                    data.extend_from_slice(&seq.to_be_bytes());
                    queue
                        .put(Packet::new(data, TransportType::Socket).with_priority(ResponsePriority::GuaranteedQuickest))
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut last = [None::<u16>; 4];
    while let Some(packet) = queue.take() {
        let data = packet.data();
        let seq = u16::from_be_bytes([data[1], data[2]]);
        let slot = &mut last[data[0] as usize];
        assert!(slot.map_or(true, |prev| prev < seq));
        *slot = Some(seq);
    }
    assert_eq!(last, [Some(199); 4]);
}

#[test]
fn test_two_convey_ids_are_two_sessions() {
    let (manager, _events) = manager();
    let (tx, _rx) = mpsc::channel(1);
    let remote = peer(1, 5000);

    let a = manager.resolve_datagram(1, remote, &tx).unwrap();
    let b = manager.resolve_datagram(2, remote, &tx).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(manager.get_session_by_datagram(remote, 1).unwrap().id(), a.id());
    assert_eq!(manager.get_session_by_datagram(remote, 2).unwrap().id(), b.id());
}

#[test]
fn test_global_cap_closes_the_extra_session() {
    let (manager, events) = manager_with(SessionSettings {
        max_connections: 1,
        ..SessionSettings::default()
    });
    let (tx, _rx) = mpsc::channel(1);
    let first = manager.create_socket_session(ChannelId(1), peer(1, 1), tx.clone()).unwrap();
    let second = manager.create_socket_session(ChannelId(2), peer(2, 1), tx).unwrap();

    assert!(!first.is_closed());
    assert!(second.is_closed());
    assert_eq!(events.causes(), vec![DisconnectCause::ReachedMaxConnection]);
    assert_eq!(events.count(EventKind::ChannelActive), 2);
}

#[test]
fn test_ban_closes_live_sessions_and_refuses_new_ones() {
    let (manager, events) = manager();
    let (tx, _rx) = mpsc::channel(1);
    let banned: IpAddr = peer(1, 0).ip();
    manager.create_socket_session(ChannelId(1), peer(1, 1), tx.clone()).unwrap();
    manager.create_socket_session(ChannelId(2), peer(1, 2), tx.clone()).unwrap();
    let other = manager.create_socket_session(ChannelId(3), peer(2, 1), tx.clone()).unwrap();

    assert_eq!(manager.ban_address(banned), 2);
    assert!(!other.is_closed());
    assert_eq!(events.causes(), vec![DisconnectCause::Ban, DisconnectCause::Ban]);
    assert!(manager.create_socket_session(ChannelId(4), peer(1, 3), tx).is_err());
    assert!(manager.filter().is_banned(banned));
}

#[test]
fn test_reconnection_preempt_old() {
    let (manager, events) = manager_with(SessionSettings {
        reconnection: ReconnectionPolicy::PreemptOld,
        ..SessionSettings::default()
    });
    let (tx, _rx) = mpsc::channel(1);
    let first = manager.create_socket_session(ChannelId(1), peer(1, 1), tx.clone()).unwrap();
    let second = manager.create_socket_session(ChannelId(2), peer(1, 2), tx).unwrap();

    manager.associate_player(&first, "alice").unwrap();
    manager.associate_player(&second, "alice").unwrap();

    assert!(first.is_closed());
    assert_eq!(manager.get_session_by_player("alice").unwrap().id(), second.id());
    assert_eq!(events.causes(), vec![DisconnectCause::Reconnection]);
}
