//! # Server Events
//!
//! What the network core reports to the application. Events are emitted into an
//! [`EventSink`]: the engine's sink is the request queue, whose worker threads
//! hand each event to the [`Dispatcher`](crate::protocol::dispatcher::Dispatcher).

use crate::core::data::DataCollection;
use crate::session::disconnect::DisconnectCause;
use crate::session::Session;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelActive,
    SessionRead,
    SessionException,
    ChannelInactive,
    ConnectionRefused,
}

impl EventKind {
    /// Events a handler must see for its session bookkeeping to stay correct.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            EventKind::ChannelActive | EventKind::SessionException | EventKind::ChannelInactive
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ChannelActive => "CHANNEL_ACTIVE",
            EventKind::SessionRead => "SESSION_READ",
            EventKind::SessionException => "SESSION_EXCEPTION",
            EventKind::ChannelInactive => "CHANNEL_INACTIVE",
            EventKind::ConnectionRefused => "CONNECTION_REFUSED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A session was registered and can be written to.
    ChannelActive { session: Arc<Session> },
    /// A complete message arrived.
    SessionRead {
        session: Arc<Session>,
        message: DataCollection,
    },
    /// A session-fatal error; the session is closed right after.
    SessionException {
        session: Arc<Session>,
        error: String,
    },
    /// The session closed. Emitted exactly once per session.
    ChannelInactive {
        session: Arc<Session>,
        cause: DisconnectCause,
    },
    /// Refused by the connection filter, no session was created.
    ConnectionRefused { address: SocketAddr, reason: String },
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::ChannelActive { .. } => EventKind::ChannelActive,
            ServerEvent::SessionRead { .. } => EventKind::SessionRead,
            ServerEvent::SessionException { .. } => EventKind::SessionException,
            ServerEvent::ChannelInactive { .. } => EventKind::ChannelInactive,
            ServerEvent::ConnectionRefused { .. } => EventKind::ConnectionRefused,
        }
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            ServerEvent::ChannelActive { session }
            | ServerEvent::SessionRead { session, .. }
            | ServerEvent::SessionException { session, .. }
            | ServerEvent::ChannelInactive { session, .. } => Some(session),
            ServerEvent::ConnectionRefused { .. } => None,
        }
    }
}

/// Receiver of server events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ServerEvent);
}
