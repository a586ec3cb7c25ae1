//! Group sender keys.
//!
//! Sender keys allow efficient one-to-many encryption in groups.
//! Each sender maintains a chain key that all group members share.
//! Records are created lazily: looking one up inserts an empty record.

use std::fmt;

use dashmap::DashMap;
use libsignal_protocol::{ProtocolAddress, SenderKeyRecord as SignalSenderKeyRecord, SignalProtocolError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionAddress;

/// Derive the distribution id for a group.
/// We use a deterministic UUID derived from the group id.
pub fn group_distribution_id(group_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("veil-group-{group_id}").as_bytes())
}

/// A sender key is addressed by group and sending device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderKeyName {
    pub group_id: String,
    pub sender: SessionAddress,
}

impl SenderKeyName {
    pub fn new(group_id: impl Into<String>, sender: SessionAddress) -> Self {
        Self {
            group_id: group_id.into(),
            sender,
        }
    }

    /// The name libsignal refers to as (sender, distribution id).
    pub fn from_distribution(sender: &ProtocolAddress, distribution_id: Uuid) -> Self {
        Self::new(distribution_id.to_string(), SessionAddress::from(sender))
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.sender, self.group_id)
    }
}

/// Serialized sender key chain state. Empty until the first chain is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    record: Vec<u8>,
}

impl SenderKeyRecord {
    pub fn new(record: Vec<u8>) -> Self {
        Self { record }
    }

    pub fn from_record(record: &SignalSenderKeyRecord) -> Result<Self, SignalProtocolError> {
        Ok(Self::new(record.serialize()?))
    }

    /// `None` while the record holds no chain.
    pub fn to_record(&self) -> Result<Option<SignalSenderKeyRecord>, SignalProtocolError> {
        if self.is_empty() {
            return Ok(None);
        }
        SignalSenderKeyRecord::deserialize(&self.record).map(Some)
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.record
    }
}

#[derive(Debug, Default)]
pub struct SenderKeyRegistry {
    keys: DashMap<SenderKeyName, SenderKeyRecord>,
}

impl SenderKeyRegistry {
    pub fn from_entries(
        entries: impl IntoIterator<Item = (SenderKeyName, SenderKeyRecord)>,
    ) -> Self {
        Self {
            keys: entries.into_iter().collect(),
        }
    }

    /// Return the record for `name`, inserting an empty one if absent.
    /// The insert happens under the shard lock, so concurrent callers
    /// observe the same record.
    pub fn find_or_create(&self, name: &SenderKeyName) -> SenderKeyRecord {
        if let Some(existing) = self.keys.get(name) {
            return existing.value().clone();
        }
        self.keys.entry(name.clone()).or_default().value().clone()
    }

    pub fn put(&self, name: SenderKeyName, record: SenderKeyRecord) {
        self.keys.insert(name, record);
    }

    pub fn contains(&self, name: &SenderKeyName) -> bool {
        self.keys.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn to_sorted_vec(&self) -> Vec<(SenderKeyName, SenderKeyRecord)> {
        let mut entries: Vec<_> = self
            .keys
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(group: &str) -> SenderKeyName {
        SenderKeyName::new(group, SessionAddress::new("alice", 1))
    }

    #[test]
    fn distribution_id_is_deterministic() {
        assert_eq!(group_distribution_id("g1"), group_distribution_id("g1"));
        assert_ne!(group_distribution_id("g1"), group_distribution_id("g2"));
    }

    #[test]
    fn lookup_inserts_empty_record() {
        let registry = SenderKeyRegistry::default();
        let n = name("family");
        assert!(!registry.contains(&n));

        let first = registry.find_or_create(&n);
        assert!(first.is_empty());
        assert!(registry.contains(&n));
        assert_eq!(registry.find_or_create(&n), first);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn put_overwrites() {
        let registry = SenderKeyRegistry::default();
        let n = name("work");
        registry.find_or_create(&n);
        registry.put(n.clone(), SenderKeyRecord::new(vec![9, 9]));
        assert_eq!(registry.find_or_create(&n).as_bytes(), &[9, 9]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_record_has_no_chain() {
        assert!(SenderKeyRecord::default().to_record().unwrap().is_none());
    }

    #[test]
    fn display_names_sender_and_group() {
        assert_eq!(name("g").to_string(), "alice.1::g");
    }

    #[test]
    fn concurrent_lookups_agree() {
        let registry = std::sync::Arc::new(SenderKeyRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.find_or_create(&name("race")))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_empty());
        }
        assert_eq!(registry.len(), 1);
    }
}
