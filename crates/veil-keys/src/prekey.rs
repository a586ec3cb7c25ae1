//! One-time pre-key pool.
//!
//! Pre-keys are one-time-use Curve25519 key pairs used in the X3DH
//! key agreement protocol. The pool keeps them in id order; ids are
//! assigned by the caller and must strictly increase.

use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use libsignal_protocol::{PreKeyId, PreKeyRecord};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::identity::SerializableKeyPair;

/// Number of one-time pre-keys to generate initially.
pub const INITIAL_PREKEY_COUNT: u32 = 100;

/// Threshold below which we should replenish pre-keys.
pub const PREKEY_REPLENISH_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyEntry {
    pub id: u32,
    pub key_pair: SerializableKeyPair,
}

impl PreKeyEntry {
    pub fn new(id: u32, key_pair: SerializableKeyPair) -> Self {
        Self { id, key_pair }
    }

    pub fn generate(id: u32) -> Self {
        Self::new(id, SerializableKeyPair::generate())
    }

    pub fn to_record(&self) -> Result<PreKeyRecord> {
        Ok(PreKeyRecord::new(
            PreKeyId::from(self.id),
            &self.key_pair.to_key_pair()?,
        ))
    }

    /// The public half, ready for upload.
    pub fn to_public(&self) -> SerializablePreKey {
        SerializablePreKey {
            id: self.id,
            public_key: self.key_pair.public_key.clone(),
        }
    }
}

/// A one-time pre-key's public portion for protocol transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializablePreKey {
    pub id: u32,
    pub public_key: Vec<u8>,
}

/// Ordered pool of one-time pre-keys.
///
/// Appends (the replenishment task) and tail reads (session setup) may
/// run concurrently; the lock is internal. The last appended id survives
/// removal of that entry, so consumed ids are never handed out again.
#[derive(Debug, Default)]
pub struct PreKeyPool {
    state: RwLock<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<PreKeyEntry>,
    last_id: u32,
}

impl PreKeyPool {
    /// Rebuild a pool from persisted entries, restoring id order.
    pub fn from_entries(mut entries: Vec<PreKeyEntry>, last_id: u32) -> Self {
        entries.sort_by_key(|entry| entry.id);
        entries.dedup_by_key(|entry| entry.id);
        let last_id = entries.last().map_or(last_id, |entry| entry.id.max(last_id));
        Self {
            state: RwLock::new(PoolState { entries, last_id }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry. Its id must be greater than every id appended so far.
    pub fn push(&self, entry: PreKeyEntry) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if entry.id <= state.last_id {
            return Err(StoreError::PreKeyOutOfOrder {
                last: state.last_id,
                got: entry.id,
            });
        }
        state.last_id = entry.id;
        state.entries.push(entry);
        Ok(())
    }

    /// Generate `count` entries with the ids following the last one and
    /// append them. The range is claimed under the write lock, so concurrent
    /// callers never receive overlapping ids.
    pub fn generate(&self, count: u32) -> Result<Vec<PreKeyEntry>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let last = state.last_id;
        let end = last
            .checked_add(count)
            .ok_or(StoreError::PreKeyIdsExhausted { last, count })?;

        let generated: Vec<PreKeyEntry> = (last + 1..=end).map(PreKeyEntry::generate).collect();
        state.entries.extend(generated.iter().cloned());
        state.last_id = end;
        Ok(generated)
    }

    pub fn find(&self, id: Option<u32>) -> Option<PreKeyEntry> {
        let id = id?;
        self.read()
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn remove(&self, id: u32) -> Option<PreKeyEntry> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let index = state.entries.iter().position(|entry| entry.id == id)?;
        Some(state.entries.remove(index))
    }

    /// Id of the most recently appended entry, or 0 if none was ever appended.
    pub fn last_id(&self) -> u32 {
        self.read().last_id
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<PreKeyEntry> {
        self.read().entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(ids: &[u32]) -> PreKeyPool {
        let pool = PreKeyPool::default();
        for &id in ids {
            pool.push(PreKeyEntry::generate(id)).unwrap();
        }
        pool
    }

    #[test]
    fn empty_pool_last_id_is_zero() {
        let pool = PreKeyPool::default();
        assert!(pool.is_empty());
        assert_eq!(pool.last_id(), 0);
    }

    #[test]
    fn find_by_id() {
        let pool = pool_with(&[5, 7, 9]);
        assert_eq!(pool.last_id(), 9);
        assert_eq!(pool.find(Some(7)).unwrap().id, 7);
        assert!(pool.find(Some(8)).is_none());
        assert!(pool.find(None).is_none());
    }

    #[test]
    fn rejects_non_increasing_ids() {
        let pool = pool_with(&[5, 7]);
        let err = pool.push(PreKeyEntry::generate(7)).unwrap_err();
        assert!(matches!(err, StoreError::PreKeyOutOfOrder { last: 7, got: 7 }));
        assert!(pool.push(PreKeyEntry::generate(3)).is_err());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn remove_keeps_order() {
        let pool = pool_with(&[1, 2, 3]);
        assert_eq!(pool.remove(2).unwrap().id, 2);
        assert!(pool.remove(2).is_none());
        let ids: Vec<u32> = pool.to_vec().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3]);

        assert_eq!(pool.remove(3).unwrap().id, 3);
        assert_eq!(pool.last_id(), 3);
        assert!(pool.push(PreKeyEntry::generate(3)).is_err());
    }

    #[test]
    fn generate_claims_following_ids() {
        let pool = pool_with(&[4]);
        let ids: Vec<u32> = pool.generate(3).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
        assert_eq!(pool.last_id(), 7);
        assert!(pool.generate(0).unwrap().is_empty());
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn generate_refuses_to_wrap_ids() {
        let pool = pool_with(&[u32::MAX - 1]);
        let err = pool.generate(2).unwrap_err();
        assert!(matches!(
            err,
            StoreError::PreKeyIdsExhausted { last, count: 2 } if last == u32::MAX - 1
        ));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.generate(1).unwrap()[0].id, u32::MAX);
        assert!(pool.generate(1).is_err());
    }

    #[test]
    fn concurrent_generate_never_overlaps() {
        let pool = std::sync::Arc::new(PreKeyPool::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.generate(25).unwrap())
            })
            .collect();
        let mut ids: Vec<u32> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .map(|entry| entry.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=100).collect::<Vec<u32>>());
        assert_eq!(pool.len(), 100);
    }

    #[test]
    fn from_entries_sorts_and_dedups() {
        let a = PreKeyEntry::generate(4);
        let b = PreKeyEntry::generate(2);
        let pool = PreKeyPool::from_entries(vec![a.clone(), b, a], 0);
        let ids: Vec<u32> = pool.to_vec().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(pool.last_id(), 4);

        let drained = PreKeyPool::from_entries(Vec::new(), 12);
        assert!(drained.is_empty());
        assert_eq!(drained.last_id(), 12);
    }

    #[test]
    fn entry_converts_to_record() {
        let entry = PreKeyEntry::generate(11);
        let record = entry.to_record().unwrap();
        assert_eq!(u32::from(record.id().unwrap()), 11);
        assert_eq!(entry.to_public().public_key, entry.key_pair.public_key);
    }
}
