//! Per-peer Signal sessions.
//!
//! A session is the serialized Double Ratchet state for one peer device.
//! Its presence means a secure channel is believed established.

use std::fmt;

use dashmap::DashMap;
use libsignal_protocol::{ProtocolAddress, SessionRecord, SignalProtocolError};
use serde::{Deserialize, Serialize};

/// Address of a peer device: account name plus device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionAddress {
    pub name: String,
    pub device_id: u32,
}

impl SessionAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    pub fn to_protocol_address(&self) -> ProtocolAddress {
        ProtocolAddress::new(self.name.clone(), self.device_id.into())
    }
}

impl From<&ProtocolAddress> for SessionAddress {
    fn from(addr: &ProtocolAddress) -> Self {
        Self::new(addr.name(), u32::from(addr.device_id()))
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// Opaque ratchet state for one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    record: Vec<u8>,
}

impl Session {
    pub fn new(record: Vec<u8>) -> Self {
        Self { record }
    }

    pub fn from_record(record: &SessionRecord) -> Result<Self, SignalProtocolError> {
        Ok(Self::new(record.serialize()?))
    }

    pub fn to_record(&self) -> Result<SessionRecord, SignalProtocolError> {
        SessionRecord::deserialize(&self.record)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.record
    }
}

/// Concurrent map of peer address to session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionAddress, Session>,
}

impl SessionRegistry {
    pub fn from_entries(entries: impl IntoIterator<Item = (SessionAddress, Session)>) -> Self {
        Self {
            sessions: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, address: &SessionAddress) -> Option<Session> {
        self.sessions.get(address).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, address: &SessionAddress) -> bool {
        self.sessions.contains_key(address)
    }

    /// Insert or overwrite; returns the replaced session.
    pub fn put(&self, address: SessionAddress, session: Session) -> Option<Session> {
        self.sessions.insert(address, session)
    }

    pub fn remove(&self, address: &SessionAddress) -> Option<Session> {
        self.sessions.remove(address).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Entries sorted by address.
    pub fn to_sorted_vec(&self) -> Vec<(SessionAddress, Session)> {
        let mut entries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
