//! App-state sync keys and LT-hash state.
//!
//! App-state patches are reconciled across devices per sync category.
//! Each category keeps a version counter and a running 128-byte LT-hash:
//! 64 little-endian u16 lanes to which HKDF-expanded values are added
//! (set operations) or from which they are subtracted (removals).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, StoreError};

pub const LT_HASH_SIZE: usize = 128;
const LT_HASH_INFO: &[u8] = b"WhatsApp Patch Integrity";

/// App-state sync category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncType {
    CriticalBlock,
    CriticalUnblockLow,
    RegularHigh,
    Regular,
    RegularLow,
}

impl SyncType {
    pub const ALL: [SyncType; 5] = [
        SyncType::CriticalBlock,
        SyncType::CriticalUnblockLow,
        SyncType::RegularHigh,
        SyncType::Regular,
        SyncType::RegularLow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncType::CriticalBlock => "critical_block",
            SyncType::CriticalUnblockLow => "critical_unblock_low",
            SyncType::RegularHigh => "regular_high",
            SyncType::Regular => "regular",
            SyncType::RegularLow => "regular_low",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        SyncType::ALL
            .into_iter()
            .find(|sync_type| sync_type.as_str() == s)
            .ok_or_else(|| StoreError::Config(format!("unknown sync type: {s}")))
    }
}

/// Key used to decrypt app-state patches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateSyncKey {
    pub key_id: Vec<u8>,
    pub key_data: Zeroizing<Vec<u8>>,
    pub fingerprint: Vec<u8>,
    pub timestamp: u64,
}

/// Incremental hash state of one sync category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LtHashState {
    pub sync_type: SyncType,
    pub version: u64,
    pub hash: Vec<u8>,
    /// Index MAC -> value MAC of every live mutation.
    pub index_value_map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl LtHashState {
    pub fn new(sync_type: SyncType) -> Self {
        Self {
            sync_type,
            version: 0,
            hash: vec![0; LT_HASH_SIZE],
            index_value_map: BTreeMap::new(),
        }
    }

    /// Apply one patch and move to `version`.
    ///
    /// `set` holds (index MAC, value MAC) pairs: the value is added to the
    /// hash and any value previously stored at that index is subtracted.
    /// `removed` holds index MACs whose stored value is subtracted; unknown
    /// indexes are ignored.
    pub fn apply_patch<K, V>(&mut self, version: u64, set: &[(K, V)], removed: &[K]) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        if self.hash.len() != LT_HASH_SIZE {
            return Err(StoreError::Snapshot(format!(
                "lt-hash of {} bytes, expected {LT_HASH_SIZE}",
                self.hash.len()
            )));
        }
        for index in removed {
            if let Some(previous) = self.index_value_map.remove(index.as_ref()) {
                mix(&mut self.hash, &expand(&previous)?, u16::wrapping_sub);
            }
        }
        for (index, value) in set {
            let value = value.as_ref();
            let previous = self
                .index_value_map
                .insert(index.as_ref().to_vec(), value.to_vec());
            if let Some(previous) = previous {
                mix(&mut self.hash, &expand(&previous)?, u16::wrapping_sub);
            }
            mix(&mut self.hash, &expand(value)?, u16::wrapping_add);
        }
        self.version = version;
        Ok(())
    }
}

fn expand(value: &[u8]) -> Result<[u8; LT_HASH_SIZE]> {
    let mut okm = [0u8; LT_HASH_SIZE];
    Hkdf::<Sha256>::new(None, value)
        .expand(LT_HASH_INFO, &mut okm)
        .map_err(|_| StoreError::InvalidKey("hkdf output too long".into()))?;
    Ok(okm)
}

fn mix(hash: &mut [u8], value: &[u8; LT_HASH_SIZE], op: fn(u16, u16) -> u16) {
    for (lane, operand) in hash.chunks_exact_mut(2).zip(value.chunks_exact(2)) {
        let a = u16::from_le_bytes([lane[0], lane[1]]);
        let b = u16::from_le_bytes([operand[0], operand[1]]);
        lane.copy_from_slice(&op(a, b).to_le_bytes());
    }
}

/// Sync keys in arrival order; the newest is handed out by `latest`.
#[derive(Debug, Default)]
pub struct AppKeyPool {
    keys: RwLock<Vec<AppStateSyncKey>>,
}

impl AppKeyPool {
    pub fn from_keys(keys: Vec<AppStateSyncKey>) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }

    pub fn extend(&self, keys: impl IntoIterator<Item = AppStateSyncKey>) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(keys);
    }

    pub fn find(&self, key_id: &[u8]) -> Option<AppStateSyncKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|key| key.key_id == key_id)
            .cloned()
    }

    pub fn latest(&self) -> Option<AppStateSyncKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    pub fn to_vec(&self) -> Vec<AppStateSyncKey> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Concurrent map of sync category to hash state. Lookups never insert.
#[derive(Debug, Default)]
pub struct HashStateStore {
    states: DashMap<SyncType, LtHashState>,
}

impl HashStateStore {
    pub fn from_states(states: impl IntoIterator<Item = LtHashState>) -> Self {
        Self {
            states: states
                .into_iter()
                .map(|state| (state.sync_type, state))
                .collect(),
        }
    }

    pub fn get(&self, sync_type: SyncType) -> Option<LtHashState> {
        self.states.get(&sync_type).map(|entry| entry.value().clone())
    }

    pub fn put(&self, sync_type: SyncType, state: LtHashState) {
        self.states.insert(sync_type, state);
    }

    pub fn to_sorted_vec(&self) -> Vec<LtHashState> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by_key(|state| state.sync_type);
        states
    }
}
