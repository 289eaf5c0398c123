//! # gamewire
//!
//! Network core for multiplayer game servers: one session model over raw
//! sockets, multiplexed datagrams, websockets and reliable UDP.
//!
//! ## Layers
//! - [`core`]: binary packet framing, compression and encryption, payload (de)serialization
//! - [`session`]: sessions, per-session outbound queues with priority-gated admission, the session manager
//! - [`protocol`]: server events, prioritized request queue, dispatcher, response builder
//! - [`engine`]: tokio accept, read and write loops, handler worker threads, maintenance sweeps
//! - [`service`]: [`NetworkService`](service::NetworkService), the assembled server
//!
//! ## Wire format
//! ```text
//! +--------+----------------------+-------------------+
//! | header | length (2 or 4 B BE) | payload           |
//! +--------+----------------------+-------------------+
//! ```
//! The header byte carries flags for framing, payload size class, compression,
//! encryption and serialization format. Datagrams carry no length field.

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod service;
pub mod session;
pub mod utils;

pub use config::NetworkConfig;
pub use crate::core::data::{DataCollection, DataType, DataValue};
pub use crate::core::packet::{Packet, ResponsePriority, TransportType};
pub use error::{ProtocolError, Result};
pub use protocol::{Dispatcher, EventKind, Response, ServerEvent};
pub use service::{NetworkService, SocketClient};
pub use session::{DisconnectCause, Session, SessionManager};
