//! # Requests
//!
//! Inbound work handed from the I/O tasks to the handler threads.
//!
//! A [`Request`] wraps a [`ServerEvent`] with a priority and a timestamp. The
//! [`RequestQueue`] is a bounded priority queue: the lowest numeric priority is
//! taken first, ties go to the earlier timestamp, then to submission order.
//!
//! `take` blocks the calling thread until a request is available. Closing the
//! queue wakes every blocked taker so handler threads can exit.
//!
//! Capacity bounds reads and refusals only. Lifecycle events of a session
//! (active, exception, inactive) are always accepted while the queue is open,
//! so handlers never miss the close of a session they are tracking.

use crate::error::constants::ERR_REQUEST_QUEUE_CLOSED;
use crate::error::{ProtocolError, Result};
use crate::protocol::event::{EventKind, EventSink, ServerEvent};
use crate::utils::metrics::NetworkStatistics;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RequestPriority {
    Quickest = 1,
    Highest = 2,
    Normal = 3,
    Lowest = 4,
}

impl RequestPriority {
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Priority given to events emitted by the engine.
    ///
    /// Every event of a session shares one level so they are handled in arrival order.
    pub fn for_event(kind: EventKind) -> Self {
        match kind {
            EventKind::ConnectionRefused => RequestPriority::Lowest,
            EventKind::ChannelActive
            | EventKind::SessionRead
            | EventKind::SessionException
            | EventKind::ChannelInactive => RequestPriority::Normal,
        }
    }
}

#[derive(Debug)]
pub struct Request {
    event: ServerEvent,
    priority: RequestPriority,
    created_at: Instant,
    sequence: u64,
}

impl Request {
    pub fn event(&self) -> &ServerEvent {
        &self.event
    }

    pub fn into_event(self) -> ServerEvent {
        self.event
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

// Ordering means "handled before": priority, then timestamp, then sequence
impl Ord for Request {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Request {}

pub struct RequestQueue {
    heap: Mutex<BinaryHeap<Reverse<Request>>>,
    available: Condvar,
    capacity: usize,
    closed: AtomicBool,
    sequence: AtomicU64,
    statistics: Arc<NetworkStatistics>,
}

impl RequestQueue {
    pub fn new(capacity: usize, statistics: Arc<NetworkStatistics>) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            capacity,
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            statistics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Request>>> {
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue an event without blocking.
    ///
    /// # Errors
    /// - `RequestQueueFull` at capacity
    /// - `IllegalState` once the queue is closed
    pub fn offer(&self, event: ServerEvent, priority: RequestPriority) -> Result<()> {
        self.push(event, priority, true)
    }

    /// Enqueue an event even when the queue is at capacity.
    ///
    /// # Errors
    /// `IllegalState` once the queue is closed
    pub fn offer_unbounded(&self, event: ServerEvent, priority: RequestPriority) -> Result<()> {
        self.push(event, priority, false)
    }

    fn push(&self, event: ServerEvent, priority: RequestPriority, bounded: bool) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::IllegalState(
                ERR_REQUEST_QUEUE_CLOSED.to_string(),
            ));
        }

        let mut heap = self.lock();
        if bounded && heap.len() >= self.capacity {
            return Err(ProtocolError::RequestQueueFull);
        }
        heap.push(Reverse(Request {
            event,
            priority,
            created_at: Instant::now(),
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
        }));
        drop(heap);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a request is available. Returns `None` once closed and drained.
    pub fn take(&self) -> Option<Request> {
        let mut heap = self.lock();
        loop {
            if let Some(Reverse(request)) = heap.pop() {
                return Some(request);
            }
            if self.is_closed() {
                return None;
            }
            heap = self
                .available
                .wait(heap)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`RequestQueue::take`], giving up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Request> {
        let deadline = Instant::now() + timeout;
        let mut heap = self.lock();
        loop {
            if let Some(Reverse(request)) = heap.pop() {
                return Some(request);
            }
            let now = Instant::now();
            if self.is_closed() || now >= deadline {
                return None;
            }
            heap = self
                .available
                .wait_timeout(heap, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Refuse new requests and wake every blocked taker. Pending requests are still handed out.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        // Taking the lock orders the flag against a taker about to wait
        drop(self.lock());
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventSink for RequestQueue {
    fn emit(&self, event: ServerEvent) {
        let kind = event.kind();
        let session_id = event.session().map(|s| s.id());
        let priority = RequestPriority::for_event(kind);
        let result = if kind.is_lifecycle() {
            self.offer_unbounded(event, priority)
        } else {
            self.offer(event, priority)
        };
        if let Err(e) = result {
            self.statistics.request_dropped();
            warn!(event = %kind, ?session_id, error = %e, "Event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::DataCollection;
    use crate::session::{ChannelId, SessionManager, SessionSettings};
    use std::net::SocketAddr;
    use std::thread;
    use tokio::sync::mpsc;

    fn refused(port: u16) -> ServerEvent {
        ServerEvent::ConnectionRefused {
            address: SocketAddr::from(([10, 0, 0, 1], port)),
            reason: "test".into(),
        }
    }

    fn port_of(request: Request) -> u16 {
        match request.into_event() {
            ServerEvent::ConnectionRefused { address, .. } => address.port(),
            _ => 0,
        }
    }

    fn queue(capacity: usize) -> RequestQueue {
        RequestQueue::new(capacity, Arc::new(NetworkStatistics::new()))
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_priority_then_arrival_order() {
        let queue = queue(16);
        queue.offer(refused(1), RequestPriority::Lowest).unwrap();
        queue.offer(refused(2), RequestPriority::Normal).unwrap();
        queue.offer(refused(3), RequestPriority::Quickest).unwrap();
        queue.offer(refused(4), RequestPriority::Normal).unwrap();
        queue.offer(refused(5), RequestPriority::Highest).unwrap();

        let order: Vec<u16> = (0..5).map(|_| port_of(queue.take().unwrap())).collect();
        assert_eq!(order, vec![3, 5, 2, 4, 1]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_capacity() {
        let queue = queue(1);
        queue.offer(refused(1), RequestPriority::Normal).unwrap();
        assert!(matches!(
            queue.offer(refused(2), RequestPriority::Quickest),
            Err(ProtocolError::RequestQueueFull)
        ));
    }

    #[test]
    fn test_emit_counts_drops() {
        let stats = Arc::new(NetworkStatistics::new());
        let queue = RequestQueue::new(1, stats.clone());
        queue.emit(refused(1));
        queue.emit(refused(2));
        assert_eq!(queue.len(), 1);
        assert_eq!(stats.snapshot().requests_dropped, 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_close_wakes_blocked_taker() {
        let queue = Arc::new(queue(4));
        let taker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(taker.join().unwrap());
        assert!(queue.offer(refused(1), RequestPriority::Normal).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_close_still_drains_pending() {
        let queue = queue(4);
        queue.offer(refused(9), RequestPriority::Normal).unwrap();
        queue.close();
        assert_eq!(port_of(queue.take().unwrap()), 9);
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_take_timeout_expires() {
        let queue = queue(4);
        assert!(queue.take_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lifecycle_events_survive_a_full_queue() {
        let stats = Arc::new(NetworkStatistics::new());
        let queue = Arc::new(RequestQueue::new(1, stats.clone()));
        let manager = SessionManager::new(SessionSettings::default(), queue.clone(), stats.clone());
        let (tx, _rx) = mpsc::channel(1);

        let session = manager
            .create_socket_session(ChannelId(1), SocketAddr::from(([127, 0, 0, 1], 1)), tx)
            .unwrap();
        // Reads are still bounded
        queue.emit(ServerEvent::SessionRead {
            session: session.clone(),
            message: DataCollection::new_map(),
        });
        manager.kick(&session);

        let kinds: Vec<EventKind> = std::iter::from_fn(|| queue.take_timeout(Duration::ZERO))
            .map(|request| request.event().kind())
            .collect();
        assert_eq!(kinds, vec![EventKind::ChannelActive, EventKind::ChannelInactive]);
        assert_eq!(stats.snapshot().requests_dropped, 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_exception_does_not_overtake_earlier_reads() {
        let stats = Arc::new(NetworkStatistics::new());
        let manager = SessionManager::new(SessionSettings::default(), Arc::new(queue(16)), stats);
        let (tx, _rx) = mpsc::channel(1);
        let session = manager
            .create_socket_session(ChannelId(1), SocketAddr::from(([127, 0, 0, 1], 1)), tx)
            .unwrap();

        let requests = queue(16);
        requests.emit(ServerEvent::SessionRead {
            session: session.clone(),
            message: DataCollection::new_map(),
        });
        requests.emit(ServerEvent::SessionException {
            session,
            error: "corrupt frame".into(),
        });

        assert_eq!(requests.take().unwrap().event().kind(), EventKind::SessionRead);
        assert_eq!(requests.take().unwrap().event().kind(), EventKind::SessionException);
    }
}
