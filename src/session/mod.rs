//! # Sessions
//!
//! Uniform view of client connections across the socket, datagram, websocket
//! and KCP transports.
//!
//! ## Components
//! - **Session**: one logical connection with its outbound queue and read state
//! - **SessionManager**: creation, lookup by native handle, and close
//! - **PacketQueue**: bounded FIFO with priority-gated admission
//! - **ConnectionFilter**: ban list and per-IP limits
//! - **DatagramPacketPolicy**: convey id extraction for multiplexed UDP
//! - **DisconnectCause**: why a session closed

pub mod datagram_policy;
pub mod disconnect;
pub mod filter;
pub mod manager;
pub mod queue;
#[allow(clippy::module_inception)]
pub mod session;

pub use disconnect::DisconnectCause;
pub use manager::{SessionManager, SessionSettings};
pub use queue::{PacketQueue, PacketQueuePolicy};
pub use session::{ChannelId, Session, SessionHandle, SessionState};
