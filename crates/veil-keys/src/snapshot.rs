//! Full persisted image of a key store.
//!
//! File format: [VKEY magic(4)] [version(1)] [postcard payload]

use serde::{Deserialize, Serialize};

use crate::app_state::{AppStateSyncKey, LtHashState};
use crate::error::{Result, StoreError};
use crate::group::{SenderKeyName, SenderKeyRecord};
use crate::identity::{CompanionId, SerializableKeyPair, SignedDeviceIdentity, SignedKeyPair};
use crate::prekey::PreKeyEntry;
use crate::session::{Session, SessionAddress};

const MAGIC: &[u8; 4] = b"VKEY"; // "Veil KEYs"
const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 4 + 1;

/// Everything a key store persists. Transport secrets and counters are
/// bound to one handshake and are never part of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub id: u32,
    pub registration_id: u32,
    pub noise_key_pair: SerializableKeyPair,
    pub ephemeral_key_pair: SerializableKeyPair,
    pub identity_key_pair: SerializableKeyPair,
    /// Absent in snapshots written before the key was derived; regenerated on load.
    pub signed_key_pair: Option<SignedKeyPair>,
    pub companion_key: Vec<u8>,
    pub companion: Option<CompanionId>,
    pub companion_identity: Option<SignedDeviceIdentity>,
    pub pre_keys: Vec<PreKeyEntry>,
    pub last_pre_key_id: u32,
    pub app_state_keys: Vec<AppStateSyncKey>,
    pub sessions: Vec<(SessionAddress, Session)>,
    pub sender_keys: Vec<(SenderKeyName, SenderKeyRecord)>,
    pub hash_states: Vec<LtHashState>,
    pub known_identities: Vec<(SessionAddress, Vec<u8>)>,
}

impl KeySnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = postcard::to_allocvec(self)?;
        let mut data = Vec::with_capacity(HEADER_LEN + payload.len());
        data.extend_from_slice(MAGIC);
        data.push(VERSION);
        data.extend_from_slice(&payload);
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !has_valid_header(data) {
            return Err(StoreError::Snapshot(
                "invalid file format (expected VKEY header)".into(),
            ));
        }
        Ok(postcard::from_bytes(&data[HEADER_LEN..])?)
    }
}

/// Check if data starts with a valid VKEY header.
pub fn has_valid_header(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && &data[0..4] == MAGIC && data[4] == VERSION
}
