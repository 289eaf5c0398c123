//! # Packet Queue
//!
//! Bounded FIFO of outbound packets for one session.
//!
//! Priority only decides *admission*: once a packet is in, it leaves in the order
//! it entered. Admission is delegated to a [`PacketQueuePolicy`] that looks at how
//! full the queue is:
//!
//! | Fill       | Accepted priorities              |
//! |------------|----------------------------------|
//! | < 75%      | all                              |
//! | 75% - 90%  | `Normal` and above               |
//! | >= 90%     | `Guaranteed` and above           |
//!
//! A packet that passes the policy is still refused with
//! [`ProtocolError::PacketQueueFull`] when the queue is at capacity.
//!
//! The queue is internally synchronized. Handler threads produce into it and a
//! writer task consumes from it.

use crate::core::packet::{Packet, ResponsePriority};
use crate::error::{ProtocolError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default capacity of a session queue.
pub const DEFAULT_PACKET_QUEUE_SIZE: usize = 100;

/// Fill percentage from which packets below `Normal` are refused.
pub const NORMAL_PRIORITY_THRESHOLD: f32 = 75.0;

/// Fill percentage from which packets below `Guaranteed` are refused.
pub const GUARANTEED_PRIORITY_THRESHOLD: f32 = 90.0;

/// Admission rule evaluated on every `put`.
pub trait PacketQueuePolicy: Send + Sync {
    fn apply_policy(&self, percentage_used: f32, packet: &Packet) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPacketQueuePolicy;

impl PacketQueuePolicy for DefaultPacketQueuePolicy {
    fn apply_policy(&self, percentage_used: f32, packet: &Packet) -> Result<()> {
        let required = if percentage_used >= GUARANTEED_PRIORITY_THRESHOLD {
            ResponsePriority::Guaranteed
        } else if percentage_used >= NORMAL_PRIORITY_THRESHOLD {
            ResponsePriority::Normal
        } else {
            return Ok(());
        };

        if packet.priority() < required {
            return Err(ProtocolError::PacketQueuePolicyViolation {
                priority: packet.priority(),
                percentage_used,
            });
        }
        Ok(())
    }
}

pub struct PacketQueue {
    packets: Mutex<VecDeque<Packet>>,
    max_size: usize,
    policy: Arc<dyn PacketQueuePolicy>,
}

impl PacketQueue {
    pub fn new(max_size: usize) -> Self {
        Self::with_policy(max_size, Arc::new(DefaultPacketQueuePolicy))
    }

    pub fn with_policy(max_size: usize, policy: Arc<dyn PacketQueuePolicy>) -> Self {
        Self {
            packets: Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
            max_size,
            policy,
        }
    }

    // Packets stay structurally valid even if a holder panicked
    fn lock(&self) -> MutexGuard<'_, VecDeque<Packet>> {
        self.packets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn percentage_of(&self, len: usize) -> f32 {
        if self.max_size == 0 {
            0.0
        } else {
            len as f32 * 100.0 / self.max_size as f32
        }
    }

    /// Append a packet if the policy and the capacity allow it.
    ///
    /// # Errors
    /// - `PacketQueuePolicyViolation` when the priority is too low for the current fill
    /// - `PacketQueueFull` when the queue holds `max_size` packets
    pub fn put(&self, packet: Packet) -> Result<()> {
        let mut packets = self.lock();
        self.policy
            .apply_policy(self.percentage_of(packets.len()), &packet)?;
        if packets.len() >= self.max_size {
            return Err(ProtocolError::PacketQueueFull);
        }
        packets.push_back(packet);
        Ok(())
    }

    /// Head of the queue without removing it.
    pub fn peek(&self) -> Option<Packet> {
        self.lock().front().cloned()
    }

    /// Remove and return the head of the queue.
    pub fn take(&self) -> Option<Packet> {
        self.lock().pop_front()
    }

    /// Drop every pending packet, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut packets = self.lock();
        let dropped = packets.len();
        packets.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// `100 * len / max_size`, or 0 for a zero-capacity queue.
    pub fn percentage_used(&self) -> f32 {
        self.percentage_of(self.lock().len())
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_QUEUE_SIZE)
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}
