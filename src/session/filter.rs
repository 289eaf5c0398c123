//! # Connection Filter
//!
//! Admission control applied before a session exists: a set of banned addresses
//! and a per-IP connection counter. Counters are taken on admission and released
//! when the session closes.

use crate::error::constants::{ERR_ADDRESS_BANNED, ERR_ADDRESS_LIMIT};
use crate::error::{ProtocolError, Result};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Default)]
struct FilterState {
    banned: HashSet<IpAddr>,
    counters: HashMap<IpAddr, usize>,
}

pub struct ConnectionFilter {
    state: Mutex<FilterState>,
    /// 0 means unlimited
    max_connections_per_ip: usize,
}

impl ConnectionFilter {
    pub fn new(max_connections_per_ip: usize) -> Self {
        Self {
            state: Mutex::new(FilterState::default()),
            max_connections_per_ip,
        }
    }

    // Every update leaves the maps consistent, so a poisoned lock is still usable
    fn state(&self) -> MutexGuard<'_, FilterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse banned addresses and addresses at their limit, otherwise count the connection.
    pub fn validate_and_add(&self, address: IpAddr) -> Result<()> {
        let mut state = self.state();

        if state.banned.contains(&address) {
            warn!(%address, "Refused banned address");
            return Err(ProtocolError::RefusedConnection {
                address,
                reason: ERR_ADDRESS_BANNED.to_string(),
            });
        }

        let counter = state.counters.entry(address).or_insert(0);
        if self.max_connections_per_ip > 0 && *counter >= self.max_connections_per_ip {
            warn!(%address, connections = *counter, "Refused address at its connection limit");
            return Err(ProtocolError::RefusedConnection {
                address,
                reason: format!("{ERR_ADDRESS_LIMIT} ({})", self.max_connections_per_ip),
            });
        }

        *counter += 1;
        debug!(%address, connections = *counter, "Address admitted");
        Ok(())
    }

    pub fn release(&self, address: IpAddr) {
        let mut state = self.state();
        if let Some(counter) = state.counters.get_mut(&address) {
            *counter = counter.saturating_sub(1);
            if *counter == 0 {
                state.counters.remove(&address);
            }
        }
    }

    pub fn ban(&self, address: IpAddr) {
        self.state().banned.insert(address);
    }

    /// Returns whether the address was banned.
    pub fn unban(&self, address: IpAddr) -> bool {
        self.state().banned.remove(&address)
    }

    pub fn is_banned(&self, address: IpAddr) -> bool {
        self.state().banned.contains(&address)
    }

    pub fn banned_addresses(&self) -> Vec<IpAddr> {
        self.state().banned.iter().copied().collect()
    }

    pub fn connection_count(&self, address: IpAddr) -> usize {
        self.state().counters.get(&address).copied().unwrap_or(0)
    }
}
