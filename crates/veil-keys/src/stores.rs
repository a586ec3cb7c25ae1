//! libsignal store traits backed by a shared [`KeyStore`].
//!
//! libsignal takes each store as `&mut dyn Trait`, often several at once.
//! `ProtocolStore` is a cheap handle over the same `Arc<KeyStore>`, so a
//! caller clones it once per store argument.

use std::sync::Arc;

use libsignal_protocol::{
    Direction, GenericSignedPreKey, IdentityKey, IdentityKeyPair, IdentityKeyStore,
    KyberPreKeyId, KyberPreKeyRecord, KyberPreKeyStore, PreKeyId, PreKeyRecord, PreKeyStore,
    ProtocolAddress, SenderKeyRecord, SenderKeyStore, SessionRecord, SessionStore,
    SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore,
};
use tracing::debug;

use crate::error::StoreError;
use crate::group::{SenderKeyName, SenderKeyRecord as StoredSenderKey};
use crate::identity::{SerializableKeyPair, SignedKeyPair};
use crate::prekey::PreKeyEntry;
use crate::session::{Session, SessionAddress};
use crate::store::KeyStore;

#[derive(Clone)]
pub struct ProtocolStore {
    keys: Arc<KeyStore>,
}

impl ProtocolStore {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }
}

fn to_signal_error(e: StoreError) -> SignalProtocolError {
    match e {
        StoreError::Signal(e) => e,
        other => SignalProtocolError::InvalidArgument(other.to_string()),
    }
}

// ── Identity Key Store ──────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl IdentityKeyStore for ProtocolStore {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        self.keys
            .identity_key_pair()
            .to_identity_key_pair()
            .map_err(to_signal_error)
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        Ok(self.keys.registration_id())
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SignalProtocolError> {
        Ok(self
            .keys
            .save_identity(SessionAddress::from(address), identity.serialize().to_vec()))
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        Ok(self
            .keys
            .has_trust(&SessionAddress::from(address), Some(&identity.serialize()[..])))
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        self.keys
            .get_identity(&SessionAddress::from(address))
            .map(|bytes| IdentityKey::decode(&bytes))
            .transpose()
    }
}

// ── Kyber Pre-Key Store ────────────────────────────────────────────────
// Post-quantum pre-keys are not issued, but the decrypt functions still
// require a KyberPreKeyStore. This is a no-op stub.

#[async_trait::async_trait(?Send)]
impl KyberPreKeyStore for ProtocolStore {
    async fn get_kyber_pre_key(
        &self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        Err(SignalProtocolError::InvalidKyberPreKeyId)
    }

    async fn save_kyber_pre_key(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        _record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }

    async fn mark_kyber_pre_key_used(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }
}

// ── Pre-Key Store ───────────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl PreKeyStore for ProtocolStore {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        self.keys
            .find_pre_key_by_id(Some(id.into()))
            .ok_or(SignalProtocolError::InvalidPreKeyId)?
            .to_record()
            .map_err(to_signal_error)
    }

    async fn save_pre_key(
        &mut self,
        id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let entry = PreKeyEntry::new(id.into(), SerializableKeyPair::from_key_pair(&record.key_pair()?));
        self.keys.add_pre_key(entry).map_err(to_signal_error)
    }

    async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), SignalProtocolError> {
        let id: u32 = id.into();
        if self.keys.remove_pre_key(id).is_some() {
            debug!(pre_key_id = id, "consumed one-time pre-key");
        }
        Ok(())
    }
}

// ── Signed Pre-Key Store ────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl SignedPreKeyStore for ProtocolStore {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        self.keys
            .find_signed_key_pair_by_id(id.into())
            .ok_or(SignalProtocolError::InvalidSignedPreKeyId)?
            .to_record()
            .map_err(to_signal_error)
    }

    async fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.keys.replace_signed_key_pair(SignedKeyPair {
            id: id.into(),
            key_pair: SerializableKeyPair::from_key_pair(&record.key_pair()?),
            signature: record.signature()?,
            timestamp_millis: record.timestamp()?.epoch_millis(),
        });
        Ok(())
    }
}

// ── Session Store ───────────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl SessionStore for ProtocolStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        self.keys
            .find_session_by_address(&SessionAddress::from(address))
            .map(|session| session.to_record())
            .transpose()
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        self.keys
            .put_session(SessionAddress::from(address), Session::from_record(record)?);
        Ok(())
    }
}

// ── Sender Key Store ────────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl SenderKeyStore for ProtocolStore {
    async fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: uuid::Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.keys.put_sender_key(
            SenderKeyName::from_distribution(sender, distribution_id),
            StoredSenderKey::from_record(record)?,
        );
        Ok(())
    }

    async fn load_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: uuid::Uuid,
    ) -> Result<Option<SenderKeyRecord>, SignalProtocolError> {
        self.keys
            .find_sender_key_by_name(&SenderKeyName::from_distribution(sender, distribution_id))
            .to_record()
    }
}
