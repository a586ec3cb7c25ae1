//! Key pair material and the local/companion identity types.
//!
//! Every client holds three Curve25519 key pairs (noise, ephemeral and
//! identity) generated on first launch, plus a signed pre-key bound to the
//! identity key.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use libsignal_protocol::{
    IdentityKey, IdentityKeyPair, KeyPair, PublicKey, SignedPreKeyId, SignedPreKeyRecord,
    Timestamp,
};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::Result;

/// Signal message version spoken by this client.
pub const CURRENT_VERSION: u8 = 3;
pub const IV_LENGTH: usize = 16;
pub const KEY_LENGTH: usize = 32;
pub const MAC_LENGTH: usize = 8;
pub const SIGNATURE_LENGTH: usize = 64;
/// Type byte prefixed to serialized Curve25519 public keys.
pub const KEY_TYPE: u8 = 5;

/// A serializable Curve25519 key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableKeyPair {
    /// 33-byte type-prefixed public key.
    pub public_key: Vec<u8>,
    /// 32-byte private key.
    pub private_key: Zeroizing<Vec<u8>>,
}

impl SerializableKeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        Self::from_key_pair(&KeyPair::generate(&mut OsRng))
    }

    pub fn from_key_pair(pair: &KeyPair) -> Self {
        Self {
            public_key: pair.public_key.serialize().to_vec(),
            private_key: Zeroizing::new(pair.private_key.serialize().to_vec()),
        }
    }

    pub fn from_identity_key_pair(pair: &IdentityKeyPair) -> Self {
        Self {
            public_key: pair.public_key().serialize().to_vec(),
            private_key: Zeroizing::new(pair.private_key().serialize().to_vec()),
        }
    }

    /// Convert to libsignal's KeyPair.
    pub fn to_key_pair(&self) -> Result<KeyPair> {
        Ok(KeyPair::from_public_and_private(
            &self.public_key,
            &self.private_key,
        )?)
    }

    /// Convert to libsignal's IdentityKeyPair.
    pub fn to_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        let key_pair = self.to_key_pair()?;
        Ok(IdentityKeyPair::new(
            IdentityKey::new(key_pair.public_key),
            key_pair.private_key,
        ))
    }

    pub fn public(&self) -> Result<PublicKey> {
        Ok(PublicKey::deserialize(&self.public_key)?)
    }

    /// The 32 public key bytes without the type prefix.
    pub fn raw_public_key(&self) -> &[u8] {
        match self.public_key.first() {
            Some(&KEY_TYPE) => &self.public_key[1..],
            _ => &self.public_key,
        }
    }
}

impl fmt::Debug for SerializableKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializableKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A medium-term pre-key signed by the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKeyPair {
    pub id: u32,
    pub key_pair: SerializableKeyPair,
    /// XEdDSA signature of the serialized public key, by the identity key.
    pub signature: Vec<u8>,
    pub timestamp_millis: u64,
}

impl SignedKeyPair {
    /// Generate a new signed pre-key bound to `identity`.
    pub fn generate(id: u32, identity: &SerializableKeyPair) -> Result<Self> {
        let identity = identity.to_identity_key_pair()?;
        let key_pair = KeyPair::generate(&mut OsRng);
        let signature = identity
            .private_key()
            .calculate_signature(&key_pair.public_key.serialize(), &mut OsRng)?;

        Ok(Self {
            id,
            key_pair: SerializableKeyPair::from_key_pair(&key_pair),
            signature: signature.to_vec(),
            timestamp_millis: now_millis(),
        })
    }

    pub fn to_record(&self) -> Result<SignedPreKeyRecord> {
        Ok(SignedPreKeyRecord::new(
            SignedPreKeyId::from(self.id),
            Timestamp::from_epoch_millis(self.timestamp_millis),
            &self.key_pair.to_key_pair()?,
            &self.signature,
        ))
    }
}

/// Opaque identifier of the paired companion account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanionId(pub String);

impl fmt::Display for CompanionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The companion's signed device identity, received while pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDeviceIdentity {
    pub details: Vec<u8>,
    pub account_signature_key: Vec<u8>,
    pub account_signature: Vec<u8>,
    pub device_signature: Vec<u8>,
}

/// Generate a libsignal-style 14-bit registration id.
pub fn generate_registration_id() -> u32 {
    let mut rng = OsRng;
    rng.gen_range(1..16380)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
