//! # Packet
//!
//! One unit of outbound transport data. A packet starts life holding the raw
//! serialized payload, goes through the encoder (which replaces the payload with
//! the framed wire bytes and records the header), and is then copied into the
//! queue of every recipient session.
//!
//! The payload is a [`Bytes`] handle, so the per-recipient copies share one
//! allocation and a queued payload cannot be mutated.

use crate::core::data::DataType;
use crate::core::header::PacketHeader;
use crate::session::Session;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Transport kind of a session or packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Socket,
    Datagram,
    WebSocket,
    Kcp,
}

impl TransportType {
    /// Stream-oriented transports need a length field to delimit frames.
    pub fn needs_counting(self) -> bool {
        !matches!(self, TransportType::Datagram)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Socket => "socket",
            TransportType::Datagram => "datagram",
            TransportType::WebSocket => "websocket",
            TransportType::Kcp => "kcp",
        };
        f.write_str(name)
    }
}

/// Delivery priority of an outbound packet. Only affects queue admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ResponsePriority {
    NonGuaranteed,
    #[default]
    Normal,
    Guaranteed,
    GuaranteedQuickest,
}

/// Outbound transport data.
#[derive(Clone)]
pub struct Packet {
    data: Bytes,
    priority: ResponsePriority,
    transport: TransportType,
    data_type: DataType,
    encrypted: bool,
    header: Option<PacketHeader>,
    recipients: Vec<Arc<Session>>,
    created_at: Instant,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, transport: TransportType) -> Self {
        Self {
            data: data.into(),
            priority: ResponsePriority::default(),
            transport,
            data_type: DataType::default(),
            encrypted: false,
            header: None,
            recipients: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn with_priority(mut self, priority: ResponsePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_recipients(mut self, recipients: Vec<Arc<Session>>) -> Self {
        self.recipients = recipients;
        self
    }

    /// Replace the payload with its framed form. Used by the encoder only.
    pub(crate) fn into_framed(mut self, framed: Bytes, header: PacketHeader) -> Self {
        self.data = framed;
        self.header = Some(header);
        self
    }

    /// Copy for a single recipient queue: shares the payload, drops the recipient list.
    pub(crate) fn for_queue(&self) -> Self {
        Self {
            data: self.data.clone(),
            priority: self.priority,
            transport: self.transport,
            data_type: self.data_type,
            encrypted: self.encrypted,
            header: self.header,
            recipients: Vec::new(),
            created_at: self.created_at,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn priority(&self) -> ResponsePriority {
        self.priority
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn needs_encryption(&self) -> bool {
        self.encrypted
    }

    pub fn needs_counting(&self) -> bool {
        self.transport.needs_counting()
    }

    /// Header written by the encoder, `None` before encoding.
    pub fn header(&self) -> Option<&PacketHeader> {
        self.header.as_ref()
    }

    pub fn recipients(&self) -> &[Arc<Session>] {
        &self.recipients
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("priority", &self.priority)
            .field("transport", &self.transport)
            .field("data_type", &self.data_type)
            .field("encrypted", &self.encrypted)
            .field("header", &self.header)
            .field("recipients", &self.recipients.len())
            .finish()
    }
}
