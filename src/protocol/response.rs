//! # Response
//!
//! Builder used by handlers to push data back to clients.
//!
//! ```rust,ignore
//! writer
//!     .response()
//!     .set_message(&message)?
//!     .set_recipients(vec![session.clone()])
//!     .set_priority(ResponsePriority::Guaranteed)
//!     .write()?;
//! ```
//!
//! A response may target sessions on different transports. Recipients are
//! grouped by framing: stream transports get a length-prefixed packet, datagram
//! sessions get one without a length field. Each group is encoded once.

use crate::core::data::{DataCollection, DataType};
use crate::core::packet::{Packet, ResponsePriority, TransportType};
use crate::engine::writer::{PacketWriter, WriteReport};
use crate::error::Result;
use crate::session::Session;
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

pub struct Response {
    writer: Arc<PacketWriter>,
    content: Bytes,
    recipients: Vec<Arc<Session>>,
    priority: ResponsePriority,
    data_type: DataType,
    encrypted: bool,
}

impl Response {
    pub fn new(writer: Arc<PacketWriter>) -> Self {
        let data_type = writer.data_type();
        let encrypted = writer.encryption_enabled();
        Self {
            writer,
            content: Bytes::new(),
            recipients: Vec::new(),
            priority: ResponsePriority::default(),
            data_type,
            encrypted,
        }
    }

    /// Raw payload, already serialized with this response's data type.
    pub fn set_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    /// Serialize `message` as the payload.
    pub fn set_message(mut self, message: &DataCollection) -> Result<Self> {
        self.content = Bytes::from(message.serialize(self.data_type)?);
        Ok(self)
    }

    pub fn set_recipient(mut self, session: Arc<Session>) -> Self {
        self.recipients = vec![session];
        self
    }

    pub fn set_recipients(mut self, sessions: Vec<Arc<Session>>) -> Self {
        self.recipients = sessions;
        self
    }

    pub fn add_recipient(mut self, session: Arc<Session>) -> Self {
        self.recipients.push(session);
        self
    }

    pub fn set_priority(mut self, priority: ResponsePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Must be set before [`Response::set_message`] to affect serialization.
    pub fn set_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn set_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn priority(&self) -> ResponsePriority {
        self.priority
    }

    pub fn recipients(&self) -> &[Arc<Session>] {
        &self.recipients
    }

    /// Encode and queue the content for every recipient.
    ///
    /// # Errors
    /// Encoding errors, e.g. `EmptyPayload` when no content was set.
    pub fn write(self) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        if self.recipients.is_empty() {
            trace!("Response without recipients");
            return Ok(report);
        }

        let (stream, datagram): (Vec<_>, Vec<_>) = self
            .recipients
            .into_iter()
            .partition(|session| session.transport().needs_counting());

        for (transport, group) in [(TransportType::Socket, stream), (TransportType::Datagram, datagram)] {
            if group.is_empty() {
                continue;
            }
            let packet = Packet::new(self.content.clone(), transport)
                .with_priority(self.priority)
                .with_data_type(self.data_type)
                .with_encryption(self.encrypted)
                .with_recipients(group);
            report += self.writer.write(packet)?;
        }

        Ok(report)
    }
}
