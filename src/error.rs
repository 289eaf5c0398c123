//! # Error Types
//!
//! Error handling for the network core.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Variants are grouped by how the engine reacts to them.
//!
//! ## Error Categories
//! - **Framing**: corrupt header or length, deserialization failure. Session-fatal.
//! - **Transform**: compression or encryption failure. Session-fatal, the payload
//!   integrity cannot be trusted.
//! - **Queue**: admission refused by policy or capacity. Recoverable, the packet is dropped.
//! - **Resource**: banned address or per-IP limit. Refused before a session exists.
//! - **Lifecycle**: duplicate identity, closed session, illegal state transition.
//! - **Process**: I/O, configuration and websocket failures.
//!
//! ## Example Usage
//! ```rust
//! use gamewire::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn checked_length(raw: i32) -> Result<usize> {
//!     usize::try_from(raw).map_err(|_| ProtocolError::InvalidLength(raw as i64))
//! }
//!
//! if let Err(e) = checked_length(-1) {
//!     error!(error = %e, fatal = e.is_session_fatal(), "Rejected frame");
//! }
//! ```

use crate::core::packet::ResponsePriority;
use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Connection filter messages
    pub const ERR_ADDRESS_BANNED: &str = "The IP address has been banned";
    pub const ERR_ADDRESS_LIMIT: &str = "The IP address has reached the maximum allowed connections";

    /// Session lifecycle errors
    pub const ERR_NOT_ACTIVE: &str = "Session is not active";

    /// Request queue errors
    pub const ERR_REQUEST_QUEUE_CLOSED: &str = "Request queue is closed";
}

/// ProtocolError is the primary error type for all network core operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Invalid packet header")]
    InvalidHeader,

    #[error("Invalid packet length: {0}")]
    InvalidLength(i64),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("The packet has empty data to encode")]
    EmptyPayload,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Packet queue is full")]
    PacketQueueFull,

    #[error("Packet queue policy violation: priority {priority:?} refused at {percentage_used:.1}% usage")]
    PacketQueuePolicyViolation {
        priority: ResponsePriority,
        percentage_used: f32,
    },

    #[error("Request queue is full")]
    RequestQueueFull,

    #[error("Refused connection from {address}: {reason}")]
    RefusedConnection { address: IpAddr, reason: String },

    #[error("Duplicate session: {0}")]
    DuplicateSession(String),

    #[error("Session {0} is closed")]
    SessionClosed(u64),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the owning session must be closed after this error.
    ///
    /// Framing and transform errors leave the read-state machine in an unknown
    /// position, and I/O errors mean the transport is gone.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::InvalidHeader
                | ProtocolError::InvalidLength(_)
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::DeserializeError(_)
                | ProtocolError::CompressionFailure
                | ProtocolError::DecompressionFailure
                | ProtocolError::EncryptionFailure
                | ProtocolError::DecryptionFailure
                | ProtocolError::WebSocket(_)
        )
    }

    /// Whether this is a queue admission refusal (packet dropped, session kept).
    pub fn is_queue_rejection(&self) -> bool {
        matches!(
            self,
            ProtocolError::PacketQueueFull | ProtocolError::PacketQueuePolicyViolation { .. }
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::InvalidLength(-4).is_session_fatal());
        assert!(ProtocolError::DecryptionFailure.is_session_fatal());
        assert!(!ProtocolError::PacketQueueFull.is_session_fatal());
        assert!(!ProtocolError::DuplicateSession("alice".into()).is_session_fatal());
    }

    #[test]
    fn test_queue_rejection_classification() {
        let violation = ProtocolError::PacketQueuePolicyViolation {
            priority: ResponsePriority::NonGuaranteed,
            percentage_used: 80.0,
        };
        assert!(violation.is_queue_rejection());
        assert!(ProtocolError::PacketQueueFull.is_queue_rejection());
        assert!(!ProtocolError::InvalidHeader.is_queue_rejection());
    }
}
