//! # Datagram Packet Policy
//!
//! One UDP socket carries many logical sessions. Each datagram payload embeds a
//! convey id that tells them apart, and the policy splits a decoded collection
//! into that id and the inner message.
//!
//! [`DefaultDatagramPacketPolicy`] understands two layouts:
//! - a map with the convey id under `"u"` and the message under `"d"`
//! - an array whose last element is the convey id, the rest being the message

use crate::core::data::{DataCollection, DataValue};

/// Convey id reported when the payload carries none.
pub const EMPTY_DATAGRAM_CONVEY_ID: i32 = -1;

/// Map key of the convey id.
pub const DATAGRAM_CONVEY_ID_KEY: &str = "u";

/// Map key of the inner message.
pub const DATAGRAM_MESSAGE_DATA_KEY: &str = "d";

pub trait DatagramPacketPolicy: Send + Sync {
    /// Split a decoded datagram into `(convey id, inner message)`.
    fn apply_policy(&self, message: DataCollection) -> (i32, Option<DataCollection>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDatagramPacketPolicy;

impl DatagramPacketPolicy for DefaultDatagramPacketPolicy {
    fn apply_policy(&self, message: DataCollection) -> (i32, Option<DataCollection>) {
        match message {
            DataCollection::Map(mut map) => {
                let convey_id = map
                    .remove(DATAGRAM_CONVEY_ID_KEY)
                    .and_then(|v| v.as_int())
                    .unwrap_or(EMPTY_DATAGRAM_CONVEY_ID);
                let data = match map.remove(DATAGRAM_MESSAGE_DATA_KEY) {
                    Some(DataValue::Map(inner)) => Some(DataCollection::Map(inner)),
                    Some(DataValue::Array(inner)) => Some(DataCollection::Array(inner)),
                    _ => None,
                };
                (convey_id, data)
            }
            DataCollection::Array(mut items) => {
                let Some(last) = items.pop() else {
                    return (EMPTY_DATAGRAM_CONVEY_ID, None);
                };
                match last.as_int() {
                    Some(convey_id) => (convey_id, Some(DataCollection::Array(items))),
                    None => {
                        items.push(last);
                        (EMPTY_DATAGRAM_CONVEY_ID, Some(DataCollection::Array(items)))
                    }
                }
            }
        }
    }
}
