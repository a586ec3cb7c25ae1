//! The key store: every long- and short-lived secret of one client.
//!
//! A `KeyStore` is shared (behind an `Arc`) by all protocol tasks of a
//! client. There is no lock over the whole store: each registry is a
//! concurrent map, the pre-key and app-key pools carry their own locks and
//! each transport direction keeps its key and counter under one mutex.
//! Every mutation schedules an asynchronous snapshot write.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use dashmap::DashMap;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::app_state::{AppKeyPool, AppStateSyncKey, HashStateStore, LtHashState, SyncType};
use crate::config::StoreConfig;
use crate::controller::{Controller, ControllerKind, SaveMode};
use crate::error::{Result, StoreError};
use crate::group::{SenderKeyName, SenderKeyRecord, SenderKeyRegistry};
use crate::identity::{
    generate_registration_id, CompanionId, SerializableKeyPair, SignedDeviceIdentity,
    SignedKeyPair,
};
use crate::persistence::{PersistenceProvider, ProviderRegistry, SnapshotWriter};
use crate::prekey::{PreKeyEntry, PreKeyPool, SerializablePreKey};
use crate::session::{Session, SessionAddress, SessionRegistry};
use crate::snapshot::KeySnapshot;
use crate::trust::{AlwaysTrust, TrustPolicy};

/// Key material for a new store.
///
/// Every omitted field is generated when the store is built:
/// - `registration_id`: random 14-bit id.
/// - `noise_key_pair`, `ephemeral_key_pair`, `identity_key_pair`: random key pairs.
/// - `signed_key_pair`: derived from the identity key, with the client id as
///   its id. A supplied signed key is only kept together with the identity
///   key that signed it.
/// - `companion_key`: the public half of a random key pair.
#[derive(Debug, Default, Clone)]
pub struct KeyMaterial {
    pub registration_id: Option<u32>,
    pub noise_key_pair: Option<SerializableKeyPair>,
    pub ephemeral_key_pair: Option<SerializableKeyPair>,
    pub identity_key_pair: Option<SerializableKeyPair>,
    pub signed_key_pair: Option<SignedKeyPair>,
    pub companion_key: Option<Vec<u8>>,
}

pub struct KeyStore {
    id: u32,
    registration_id: u32,
    noise_key_pair: SerializableKeyPair,
    ephemeral_key_pair: SerializableKeyPair,
    identity_key_pair: SerializableKeyPair,
    signed_key_pair: RwLock<SignedKeyPair>,
    companion_key: Vec<u8>,
    companion: RwLock<Option<CompanionId>>,
    companion_identity: RwLock<Option<SignedDeviceIdentity>>,
    pre_keys: PreKeyPool,
    app_state_keys: AppKeyPool,
    sessions: SessionRegistry,
    sender_keys: SenderKeyRegistry,
    hash_states: HashStateStore,
    /// Remote identity keys seen per address (trust-on-first-use record).
    known_identities: DashMap<SessionAddress, Vec<u8>>,
    outbound: Mutex<CipherState>,
    inbound: Mutex<CipherState>,
    trust: Arc<dyn TrustPolicy>,
    writer: SnapshotWriter,
}

impl KeyStore {
    /// Create a store with fresh random material and schedule its first write.
    pub fn create(id: u32, provider: Arc<dyn PersistenceProvider>) -> Result<Self> {
        Self::create_with(id, KeyMaterial::default(), provider)
    }

    /// Create a store from partially supplied material; see [`KeyMaterial`].
    pub fn create_with(
        id: u32,
        material: KeyMaterial,
        provider: Arc<dyn PersistenceProvider>,
    ) -> Result<Self> {
        let identity_supplied = material.identity_key_pair.is_some();
        let identity_key_pair = material
            .identity_key_pair
            .unwrap_or_else(SerializableKeyPair::generate);
        let signed_key_pair = match material.signed_key_pair {
            Some(signed) if identity_supplied => signed,
            _ => SignedKeyPair::generate(id, &identity_key_pair)?,
        };
        let companion_key = match material.companion_key {
            Some(key) => key,
            None => SerializableKeyPair::generate().raw_public_key().to_vec(),
        };

        let store = Self::assemble(
            KeySnapshot {
                id,
                registration_id: material
                    .registration_id
                    .unwrap_or_else(generate_registration_id),
                noise_key_pair: material
                    .noise_key_pair
                    .unwrap_or_else(SerializableKeyPair::generate),
                ephemeral_key_pair: material
                    .ephemeral_key_pair
                    .unwrap_or_else(SerializableKeyPair::generate),
                identity_key_pair,
                signed_key_pair: Some(signed_key_pair),
                companion_key,
                companion: None,
                companion_identity: None,
                pre_keys: Vec::new(),
                last_pre_key_id: 0,
                app_state_keys: Vec::new(),
                sessions: Vec::new(),
                sender_keys: Vec::new(),
                hash_states: Vec::new(),
                known_identities: Vec::new(),
            },
            provider,
        )?;

        info!(id, provider = store.writer.provider().name(), "created fresh key store");
        store.schedule_save();
        Ok(store)
    }

    /// Load the persisted store for `id`, or create a fresh one when nothing
    /// is persisted or the snapshot does not decode.
    ///
    /// A provider that fails to read (I/O error, wrong password) is an
    /// error: the existing snapshot is left untouched.
    pub fn load(id: u32, provider: Arc<dyn PersistenceProvider>) -> Result<Self> {
        match provider.read(ControllerKind::Keys, id)? {
            Some(data) => match Self::decode(id, &data, provider.clone()) {
                Ok(store) => {
                    info!(id, provider = provider.name(), "loaded key store");
                    return Ok(store);
                }
                Err(e) => warn!(id, "unusable key snapshot, generating fresh keys: {e}"),
            },
            None => debug!(id, "no persisted key store"),
        }
        Self::create(id, provider)
    }

    /// Load a store that must already be persisted. Never creates or
    /// overwrites one: a missing or undecodable snapshot is an error.
    pub fn load_existing(id: u32, provider: Arc<dyn PersistenceProvider>) -> Result<Self> {
        let data = provider
            .read(ControllerKind::Keys, id)?
            .ok_or(StoreError::NotPersisted(id))?;
        Self::decode(id, &data, provider)
    }

    fn decode(id: u32, data: &[u8], provider: Arc<dyn PersistenceProvider>) -> Result<Self> {
        Self::from_snapshot(id, KeySnapshot::decode(data)?, provider)
    }

    /// Resolve the configured provider and load the store for `id`.
    pub fn open(id: u32, config: &StoreConfig, registry: &ProviderRegistry) -> Result<Self> {
        Self::load(id, registry.resolve(config)?)
    }

    fn from_snapshot(
        id: u32,
        mut snapshot: KeySnapshot,
        provider: Arc<dyn PersistenceProvider>,
    ) -> Result<Self> {
        if snapshot.id != id {
            return Err(StoreError::Snapshot(format!(
                "snapshot belongs to id {}, expected {id}",
                snapshot.id
            )));
        }
        let regenerate = snapshot.signed_key_pair.is_none();
        if regenerate {
            snapshot.signed_key_pair = Some(SignedKeyPair::generate(id, &snapshot.identity_key_pair)?);
        }
        let store = Self::assemble(snapshot, provider)?;
        if regenerate {
            store.schedule_save();
        }
        Ok(store)
    }

    fn assemble(snapshot: KeySnapshot, provider: Arc<dyn PersistenceProvider>) -> Result<Self> {
        let signed_key_pair = snapshot
            .signed_key_pair
            .ok_or_else(|| StoreError::Snapshot("missing signed key pair".into()))?;
        Ok(Self {
            id: snapshot.id,
            registration_id: snapshot.registration_id,
            noise_key_pair: snapshot.noise_key_pair,
            ephemeral_key_pair: snapshot.ephemeral_key_pair,
            identity_key_pair: snapshot.identity_key_pair,
            signed_key_pair: RwLock::new(signed_key_pair),
            companion_key: snapshot.companion_key,
            companion: RwLock::new(snapshot.companion),
            companion_identity: RwLock::new(snapshot.companion_identity),
            pre_keys: PreKeyPool::from_entries(snapshot.pre_keys, snapshot.last_pre_key_id),
            app_state_keys: AppKeyPool::from_keys(snapshot.app_state_keys),
            sessions: SessionRegistry::from_entries(snapshot.sessions),
            sender_keys: SenderKeyRegistry::from_entries(snapshot.sender_keys),
            hash_states: HashStateStore::from_states(snapshot.hash_states),
            known_identities: snapshot.known_identities.into_iter().collect(),
            outbound: Mutex::default(),
            inbound: Mutex::default(),
            trust: Arc::new(AlwaysTrust),
            writer: SnapshotWriter::new(provider, ControllerKind::Keys, snapshot.id),
        })
    }

    /// Replace the trust policy consulted by [`KeyStore::has_trust`].
    pub fn with_trust_policy(mut self, policy: Arc<dyn TrustPolicy>) -> Self {
        self.trust = policy;
        self
    }

    /// Full snapshot of the persisted fields.
    pub fn snapshot(&self) -> KeySnapshot {
        let mut known_identities: Vec<_> = self
            .known_identities
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        known_identities.sort_by(|a, b| a.0.cmp(&b.0));

        KeySnapshot {
            id: self.id,
            registration_id: self.registration_id,
            noise_key_pair: self.noise_key_pair.clone(),
            ephemeral_key_pair: self.ephemeral_key_pair.clone(),
            identity_key_pair: self.identity_key_pair.clone(),
            signed_key_pair: Some(self.signed_key_pair()),
            companion_key: self.companion_key.clone(),
            companion: self.companion(),
            companion_identity: self.companion_identity(),
            pre_keys: self.pre_keys.to_vec(),
            last_pre_key_id: self.pre_keys.last_id(),
            app_state_keys: self.app_state_keys.to_vec(),
            sessions: self.sessions.to_sorted_vec(),
            sender_keys: self.sender_keys.to_sorted_vec(),
            hash_states: self.hash_states.to_sorted_vec(),
            known_identities,
        }
    }

    fn schedule_save(&self) {
        if let Err(e) = self.save(SaveMode::Async) {
            warn!(id = self.id, "failed to schedule key store write: {e}");
        }
    }

    /// Flush one final snapshot synchronously.
    pub fn dispose(&self) -> Result<()> {
        self.save(SaveMode::Sync)
    }

    // ── Identity ────────────────────────────────────────────────────────

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn noise_key_pair(&self) -> &SerializableKeyPair {
        &self.noise_key_pair
    }

    pub fn ephemeral_key_pair(&self) -> &SerializableKeyPair {
        &self.ephemeral_key_pair
    }

    pub fn identity_key_pair(&self) -> &SerializableKeyPair {
        &self.identity_key_pair
    }

    pub fn signed_key_pair(&self) -> SignedKeyPair {
        read(&self.signed_key_pair).clone()
    }

    /// The signed pre-key, only if `id` is the currently active one.
    /// Rotated keys are not retained.
    pub fn find_signed_key_pair_by_id(&self, id: u32) -> Option<SignedKeyPair> {
        let signed = read(&self.signed_key_pair);
        (signed.id == id).then(|| signed.clone())
    }

    /// Generate a new signed pre-key and make it the only active one.
    pub fn rotate_signed_key_pair(&self, new_id: u32) -> Result<SignedKeyPair> {
        let signed = SignedKeyPair::generate(new_id, &self.identity_key_pair)?;
        self.replace_signed_key_pair(signed.clone());
        info!(id = self.id, signed_key_id = new_id, "rotated signed pre-key");
        Ok(signed)
    }

    /// Install a signed pre-key produced elsewhere (the protocol layer).
    /// The caller guarantees it is signed by this store's identity key.
    pub fn replace_signed_key_pair(&self, signed: SignedKeyPair) {
        *write(&self.signed_key_pair) = signed;
        self.schedule_save();
    }

    // ── Companion ───────────────────────────────────────────────────────

    pub fn companion_key(&self) -> &[u8] {
        &self.companion_key
    }

    pub fn companion(&self) -> Option<CompanionId> {
        read(&self.companion).clone()
    }

    pub fn has_companion(&self) -> bool {
        read(&self.companion).is_some()
    }

    pub fn set_companion(&self, companion: CompanionId) {
        *write(&self.companion) = Some(companion);
        self.schedule_save();
    }

    pub fn companion_identity(&self) -> Option<SignedDeviceIdentity> {
        read(&self.companion_identity).clone()
    }

    pub fn set_companion_identity(&self, identity: SignedDeviceIdentity) {
        *write(&self.companion_identity) = Some(identity);
        self.schedule_save();
    }

    // ── Pre-keys ────────────────────────────────────────────────────────

    pub fn has_pre_keys(&self) -> bool {
        !self.pre_keys.is_empty()
    }

    pub fn pre_key_count(&self) -> usize {
        self.pre_keys.len()
    }

    /// Id of the most recently appended pre-key, or 0 if none was ever added.
    pub fn last_pre_key_id(&self) -> u32 {
        self.pre_keys.last_id()
    }

    pub fn find_pre_key_by_id(&self, id: Option<u32>) -> Option<PreKeyEntry> {
        self.pre_keys.find(id)
    }

    /// Append a pre-key; its id must exceed [`KeyStore::last_pre_key_id`].
    pub fn add_pre_key(&self, entry: PreKeyEntry) -> Result<()> {
        self.pre_keys.push(entry)?;
        self.schedule_save();
        Ok(())
    }

    pub fn remove_pre_key(&self, id: u32) -> Option<PreKeyEntry> {
        let removed = self.pre_keys.remove(id);
        if removed.is_some() {
            self.schedule_save();
        }
        removed
    }

    /// Generate `count` pre-keys continuing after the last id and return
    /// their public halves for upload.
    pub fn generate_pre_keys(&self, count: u32) -> Result<Vec<SerializablePreKey>> {
        let generated = self.pre_keys.generate(count)?;
        if let Some(first) = generated.first() {
            debug!(id = self.id, start_id = first.id, count, "generated pre-keys");
            self.schedule_save();
        }
        Ok(generated.iter().map(PreKeyEntry::to_public).collect())
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn has_session(&self, address: &SessionAddress) -> bool {
        self.sessions.contains(address)
    }

    pub fn find_session_by_address(&self, address: &SessionAddress) -> Option<Session> {
        self.sessions.get(address)
    }

    pub fn put_session(&self, address: SessionAddress, session: Session) {
        debug!(id = self.id, %address, "storing session");
        self.sessions.put(address, session);
        self.schedule_save();
    }

    /// Discard the session with a peer, e.g. before renegotiating it.
    pub fn remove_session(&self, address: &SessionAddress) -> Option<Session> {
        let removed = self.sessions.remove(address);
        if removed.is_some() {
            info!(id = self.id, %address, "removed session");
            self.schedule_save();
        }
        removed
    }

    /// Trust decision for a peer identity, delegated to the trust policy.
    pub fn has_trust(&self, address: &SessionAddress, identity_key: Option<&[u8]>) -> bool {
        self.trust.has_trust(address, identity_key)
    }

    /// Record the identity key seen for `address`. Returns true if it
    /// replaced a different key.
    pub fn save_identity(&self, address: SessionAddress, identity_key: Vec<u8>) -> bool {
        let previous = self.known_identities.insert(address, identity_key.clone());
        let changed = previous.as_ref().is_some_and(|old| *old != identity_key);
        if previous.as_ref() != Some(&identity_key) {
            self.schedule_save();
        }
        changed
    }

    pub fn get_identity(&self, address: &SessionAddress) -> Option<Vec<u8>> {
        self.known_identities
            .get(address)
            .map(|entry| entry.value().clone())
    }

    // ── Sender keys ─────────────────────────────────────────────────────

    /// The sender key for `name`; an empty record is created and stored if
    /// none exists. Never fails.
    pub fn find_sender_key_by_name(&self, name: &SenderKeyName) -> SenderKeyRecord {
        self.sender_keys.find_or_create(name)
    }

    pub fn has_sender_key(&self, name: &SenderKeyName) -> bool {
        self.sender_keys.contains(name)
    }

    pub fn put_sender_key(&self, name: SenderKeyName, record: SenderKeyRecord) {
        self.sender_keys.put(name, record);
        self.schedule_save();
    }

    // ── App state ───────────────────────────────────────────────────────

    pub fn has_app_keys(&self) -> bool {
        !self.app_state_keys.is_empty()
    }

    pub fn add_app_keys(&self, keys: impl IntoIterator<Item = AppStateSyncKey>) {
        self.app_state_keys.extend(keys);
        self.schedule_save();
    }

    pub fn find_app_key_by_id(&self, key_id: &[u8]) -> Option<AppStateSyncKey> {
        self.app_state_keys.find(key_id)
    }

    /// The most recently added sync key. Only called while a sync is in
    /// progress, where a missing key is an error.
    pub fn app_key(&self) -> Result<AppStateSyncKey> {
        self.app_state_keys.latest().ok_or(StoreError::NoAppKeys)
    }

    pub fn find_hash_state_by_name(&self, sync_type: SyncType) -> Option<LtHashState> {
        self.hash_states.get(sync_type)
    }

    /// Store `state` under `sync_type`. The state's own category is
    /// overwritten with `sync_type`, which is the key it is persisted under.
    pub fn put_state(&self, sync_type: SyncType, mut state: LtHashState) {
        if state.sync_type != sync_type {
            warn!(id = self.id, %sync_type, state = %state.sync_type, "hash state filed under another category");
            state.sync_type = sync_type;
        }
        self.hash_states.put(sync_type, state);
        self.schedule_save();
    }

    // ── Transport ───────────────────────────────────────────────────────

    /// Current write counter; with `increment`, returns the value before
    /// advancing it. No two callers ever receive the same value.
    pub fn write_counter(&self, increment: bool) -> u64 {
        lock(&self.outbound).counter(increment)
    }

    pub fn read_counter(&self, increment: bool) -> u64 {
        lock(&self.inbound).counter(increment)
    }

    pub fn write_key(&self) -> Option<Zeroizing<Vec<u8>>> {
        lock(&self.outbound).key.clone()
    }

    pub fn read_key(&self) -> Option<Zeroizing<Vec<u8>>> {
        lock(&self.inbound).key.clone()
    }

    /// The write key with the next write counter value, taken together.
    /// `None` (and no counter advance) when no key is installed.
    pub fn next_write_nonce(&self) -> Option<(Zeroizing<Vec<u8>>, u64)> {
        lock(&self.outbound).next_nonce()
    }

    /// The read key with the next read counter value, taken together.
    pub fn next_read_nonce(&self) -> Option<(Zeroizing<Vec<u8>>, u64)> {
        lock(&self.inbound).next_nonce()
    }

    /// Install the transport keys derived by a handshake. Counters restart
    /// at zero under new keys.
    pub fn set_transport_keys(&self, write_key: Vec<u8>, read_key: Vec<u8>) {
        *lock(&self.outbound) = CipherState::keyed(write_key);
        *lock(&self.inbound) = CipherState::keyed(read_key);
    }
}

/// One transport direction. The key and its counter only change together,
/// so a counter value is never paired with a key it was already used with.
#[derive(Default)]
struct CipherState {
    key: Option<Zeroizing<Vec<u8>>>,
    counter: u64,
}

impl CipherState {
    fn keyed(key: Vec<u8>) -> Self {
        Self {
            key: Some(Zeroizing::new(key)),
            counter: 0,
        }
    }

    fn counter(&mut self, increment: bool) -> u64 {
        let value = self.counter;
        if increment {
            self.counter += 1;
        }
        value
    }

    fn next_nonce(&mut self) -> Option<(Zeroizing<Vec<u8>>, u64)> {
        let key = self.key.clone()?;
        Some((key, self.counter(true)))
    }
}

impl Controller for KeyStore {
    const KIND: ControllerKind = ControllerKind::Keys;

    fn id(&self) -> u32 {
        self.id
    }

    fn save(&self, mode: SaveMode) -> Result<()> {
        self.writer.write_with(|| self.snapshot().encode(), mode)
    }

    /// Drop the transport secrets and reset both counters. Identity,
    /// sessions, sender keys, app state and companion data are kept.
    fn clear(&self) {
        *lock(&self.outbound) = CipherState::default();
        *lock(&self.inbound) = CipherState::default();
        debug!(id = self.id, "cleared transport secrets");
    }

    fn delete(&self) -> Result<()> {
        self.writer.remove()?;
        info!(id = self.id, "deleted persisted key store");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryProvider;

    fn memory() -> Arc<dyn PersistenceProvider> {
        Arc::new(MemoryProvider::default())
    }

    fn sync_key(id: &[u8]) -> AppStateSyncKey {
        AppStateSyncKey {
            key_id: id.to_vec(),
            key_data: Zeroizing::new(vec![1; 32]),
            fingerprint: Vec::new(),
            timestamp: 0,
        }
    }

    #[test]
    fn fresh_store_has_identity_and_signed_key() {
        let store = KeyStore::create(12, memory()).unwrap();
        assert_eq!(store.id(), 12);
        assert_eq!(store.signed_key_pair().id, 12);
        assert_eq!(store.companion_key().len(), 32);
        assert!(!store.has_companion());
        assert!(!store.has_pre_keys());
        assert!(!store.has_app_keys());
        assert_ne!(store.noise_key_pair(), store.identity_key_pair());
    }

    #[test]
    fn supplied_identity_is_kept() {
        let identity = SerializableKeyPair::generate();
        let material = KeyMaterial {
            identity_key_pair: Some(identity.clone()),
            registration_id: Some(77),
            ..KeyMaterial::default()
        };
        let store = KeyStore::create_with(1, material, memory()).unwrap();
        assert_eq!(store.identity_key_pair(), &identity);
        assert_eq!(store.registration_id(), 77);
    }

    #[test]
    fn signed_key_without_its_identity_is_regenerated() {
        let foreign = SignedKeyPair::generate(99, &SerializableKeyPair::generate()).unwrap();
        let material = KeyMaterial {
            signed_key_pair: Some(foreign.clone()),
            ..KeyMaterial::default()
        };
        let store = KeyStore::create_with(4, material, memory()).unwrap();
        assert_ne!(store.signed_key_pair(), foreign);
        assert_eq!(store.signed_key_pair().id, 4);
    }

    #[test]
    fn sessions_are_addressed_exactly() {
        let store = KeyStore::create(1, memory()).unwrap();
        let a = SessionAddress::new("alice", 1);
        let b = SessionAddress::new("bob", 1);

        store.put_session(a.clone(), Session::new(vec![1]));
        assert!(store.has_session(&a));
        assert!(!store.has_session(&b));
        assert_eq!(store.find_session_by_address(&a), Some(Session::new(vec![1])));
        assert!(store.find_session_by_address(&b).is_none());

        assert!(store.remove_session(&a).is_some());
        assert!(!store.has_session(&a));
    }

    #[test]
    fn sender_key_lookup_stores_record() {
        let store = KeyStore::create(1, memory()).unwrap();
        let name = SenderKeyName::new("group", SessionAddress::new("carol", 2));
        assert!(!store.has_sender_key(&name));

        let first = store.find_sender_key_by_name(&name);
        assert!(store.has_sender_key(&name));
        assert_eq!(store.find_sender_key_by_name(&name), first);
    }

    #[test]
    fn pre_key_lookup() {
        let store = KeyStore::create(1, memory()).unwrap();
        assert_eq!(store.last_pre_key_id(), 0);
        for id in [5, 7, 9] {
            store.add_pre_key(PreKeyEntry::generate(id)).unwrap();
        }
        assert_eq!(store.last_pre_key_id(), 9);
        assert_eq!(store.find_pre_key_by_id(Some(7)).unwrap().id, 7);
        assert!(store.find_pre_key_by_id(Some(8)).is_none());
        assert!(store.find_pre_key_by_id(None).is_none());
        assert!(store.add_pre_key(PreKeyEntry::generate(9)).is_err());
    }

    #[test]
    fn generate_pre_keys_continues_ids() {
        let store = KeyStore::create(1, memory()).unwrap();
        store.add_pre_key(PreKeyEntry::generate(3)).unwrap();
        let uploaded = store.generate_pre_keys(4).unwrap();
        let ids: Vec<u32> = uploaded.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);
        assert_eq!(store.pre_key_count(), 5);
        assert_eq!(store.last_pre_key_id(), 7);
    }

    #[test]
    fn generate_pre_keys_stops_at_id_space_end() {
        let store = KeyStore::create(1, memory()).unwrap();
        store.add_pre_key(PreKeyEntry::generate(u32::MAX)).unwrap();
        assert!(matches!(
            store.generate_pre_keys(1),
            Err(StoreError::PreKeyIdsExhausted { last: u32::MAX, count: 1 })
        ));
        assert_eq!(store.pre_key_count(), 1);
        assert!(store.generate_pre_keys(0).unwrap().is_empty());
    }

    #[test]
    fn signed_key_lookup_only_matches_active_id() {
        let store = KeyStore::create(3, memory()).unwrap();
        let old_id = store.signed_key_pair().id;
        assert!(store.find_signed_key_pair_by_id(old_id).is_some());
        assert!(store.find_signed_key_pair_by_id(old_id + 1).is_none());

        let rotated = store.rotate_signed_key_pair(old_id + 1).unwrap();
        assert!(store.find_signed_key_pair_by_id(old_id).is_none());
        assert_eq!(store.find_signed_key_pair_by_id(old_id + 1), Some(rotated));
    }

    #[test]
    fn app_key_requires_a_key() {
        let store = KeyStore::create(1, memory()).unwrap();
        assert!(matches!(store.app_key(), Err(StoreError::NoAppKeys)));

        store.add_app_keys([sync_key(b"k1"), sync_key(b"k2")]);
        assert!(store.has_app_keys());
        assert_eq!(store.app_key().unwrap().key_id, b"k2");
        assert_eq!(store.find_app_key_by_id(b"k1").unwrap().key_id, b"k1");
        assert!(store.find_app_key_by_id(b"k3").is_none());
    }

    #[test]
    fn hash_state_lookup_never_creates() {
        let store = KeyStore::create(1, memory()).unwrap();
        assert!(store.find_hash_state_by_name(SyncType::RegularHigh).is_none());
        assert!(store.find_hash_state_by_name(SyncType::RegularHigh).is_none());

        let mut state = LtHashState::new(SyncType::RegularHigh);
        state.version = 4;
        store.put_state(SyncType::RegularHigh, state.clone());
        assert_eq!(store.find_hash_state_by_name(SyncType::RegularHigh), Some(state));
    }

    #[test]
    fn hash_state_survives_reload_under_its_key() {
        let provider = memory();
        let store = KeyStore::create(9, provider.clone()).unwrap();
        store.put_state(SyncType::Regular, LtHashState::new(SyncType::RegularHigh));
        assert_eq!(
            store.find_hash_state_by_name(SyncType::Regular).unwrap().sync_type,
            SyncType::Regular
        );
        store.dispose().unwrap();

        let loaded = KeyStore::load(9, provider).unwrap();
        assert!(loaded.find_hash_state_by_name(SyncType::Regular).is_some());
        assert!(loaded.find_hash_state_by_name(SyncType::RegularHigh).is_none());
    }

    #[test]
    fn counters_fetch_and_increment() {
        let store = KeyStore::create(1, memory()).unwrap();
        assert_eq!(store.write_counter(false), 0);
        assert_eq!(store.write_counter(true), 0);
        assert_eq!(store.write_counter(true), 1);
        assert_eq!(store.write_counter(false), 2);
        assert_eq!(store.read_counter(true), 0);
        assert_eq!(store.read_counter(false), 1);
    }

    #[test]
    fn nonce_comes_with_its_key() {
        let store = KeyStore::create(1, memory()).unwrap();
        assert!(store.next_write_nonce().is_none());
        assert_eq!(store.write_counter(false), 0);

        store.set_transport_keys(vec![1; 32], vec![2; 32]);
        let (key, counter) = store.next_write_nonce().unwrap();
        assert_eq!((key.as_slice(), counter), (&[1u8; 32][..], 0));
        assert_eq!(store.next_write_nonce().unwrap().1, 1);
        assert_eq!(store.next_read_nonce().unwrap().1, 0);

        store.set_transport_keys(vec![3; 32], vec![4; 32]);
        let (key, counter) = store.next_write_nonce().unwrap();
        assert_eq!((key.as_slice(), counter), (&[3u8; 32][..], 0));
    }

    #[test]
    fn clear_only_touches_transport_state() {
        let store = KeyStore::create(1, memory()).unwrap();
        let address = SessionAddress::new("dave", 1);
        let name = SenderKeyName::new("g", address.clone());
        store.set_companion(CompanionId("dave@host".into()));
        store.put_session(address.clone(), Session::new(vec![4, 2]));
        store.put_sender_key(name.clone(), SenderKeyRecord::new(vec![8]));
        store.put_state(SyncType::Regular, LtHashState::new(SyncType::Regular));
        store.set_transport_keys(vec![1; 32], vec![2; 32]);
        store.write_counter(true);
        store.read_counter(true);

        let before = store.snapshot();
        store.clear();

        assert!(store.write_key().is_none());
        assert!(store.read_key().is_none());
        assert_eq!(store.write_counter(false), 0);
        assert_eq!(store.read_counter(false), 0);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn trust_policy_is_pluggable() {
        let address = SessionAddress::new("eve", 1);
        let store = KeyStore::create(1, memory()).unwrap();
        assert!(store.has_trust(&address, None));

        let store = store.with_trust_policy(Arc::new(
            |_: &SessionAddress, key: Option<&[u8]>| key.is_some(),
        ));
        assert!(!store.has_trust(&address, None));
        assert!(store.has_trust(&address, Some(&[5u8; 33][..])));
    }

    #[test]
    fn save_identity_reports_changes() {
        let store = KeyStore::create(1, memory()).unwrap();
        let address = SessionAddress::new("frank", 1);
        assert!(!store.save_identity(address.clone(), vec![1]));
        assert!(!store.save_identity(address.clone(), vec![1]));
        assert!(store.save_identity(address.clone(), vec![2]));
        assert_eq!(store.get_identity(&address), Some(vec![2]));
    }

    #[test]
    fn dispose_persists_and_load_restores() {
        let provider = memory();
        let store = KeyStore::create(21, provider.clone()).unwrap();
        store.set_companion(CompanionId("paired".into()));
        store.dispose().unwrap();

        let loaded = KeyStore::load(21, provider).unwrap();
        assert_eq!(loaded.snapshot(), store.snapshot());
    }

    #[test]
    fn malformed_snapshot_falls_back_to_fresh_keys() {
        let provider = memory();
        provider.write(ControllerKind::Keys, 8, b"garbage").unwrap();
        let store = KeyStore::load(8, provider).unwrap();
        assert_eq!(store.id(), 8);
        assert!(!store.has_companion());
    }

    /// Provider whose reads always fail, as with a wrong password.
    struct Unreadable(MemoryProvider);

    impl PersistenceProvider for Unreadable {
        fn name(&self) -> &str {
            "unreadable"
        }

        fn read(&self, _: ControllerKind, _: u32) -> Result<Option<Vec<u8>>> {
            Err(StoreError::Snapshot("incorrect password or corrupted file".into()))
        }

        fn commit(&self, kind: ControllerKind, id: u32, data: &[u8]) -> Result<()> {
            self.0.commit(kind, id, data)
        }

        fn remove(&self, kind: ControllerKind, id: u32) -> Result<()> {
            self.0.remove(kind, id)
        }

        fn known_ids(&self) -> Result<Vec<u32>> {
            self.0.known_ids()
        }
    }

    #[test]
    fn read_failure_is_not_replaced_with_fresh_keys() {
        let provider = Arc::new(Unreadable(MemoryProvider::default()));
        provider.0.write(ControllerKind::Keys, 4, b"sealed").unwrap();

        assert!(KeyStore::load(4, provider.clone()).is_err());
        assert_eq!(
            provider.0.read(ControllerKind::Keys, 4).unwrap().as_deref(),
            Some(b"sealed".as_slice())
        );
    }

    #[test]
    fn load_existing_never_creates() {
        let provider = memory();
        assert!(matches!(
            KeyStore::load_existing(2, provider.clone()),
            Err(StoreError::NotPersisted(2))
        ));
        provider.write(ControllerKind::Keys, 2, b"garbage").unwrap();
        assert!(KeyStore::load_existing(2, provider.clone()).is_err());
        assert_eq!(
            provider.read(ControllerKind::Keys, 2).unwrap().as_deref(),
            Some(b"garbage".as_slice())
        );

        let store = KeyStore::create(3, provider.clone()).unwrap();
        store.dispose().unwrap();
        let loaded = KeyStore::load_existing(3, provider).unwrap();
        assert_eq!(loaded.snapshot(), store.snapshot());
    }

    #[test]
    fn snapshot_for_other_id_is_rejected() {
        let provider = memory();
        let other = KeyStore::create(1, provider.clone()).unwrap();
        provider
            .write(ControllerKind::Keys, 2, &other.snapshot().encode().unwrap())
            .unwrap();
        let store = KeyStore::load(2, provider).unwrap();
        assert_ne!(store.identity_key_pair(), other.identity_key_pair());
    }

    #[test]
    fn missing_signed_key_is_regenerated_on_load() {
        let provider = memory();
        let store = KeyStore::create(6, provider.clone()).unwrap();
        let mut snapshot = store.snapshot();
        snapshot.signed_key_pair = None;
        provider
            .write(ControllerKind::Keys, 6, &snapshot.encode().unwrap())
            .unwrap();

        let loaded = KeyStore::load(6, provider).unwrap();
        assert_eq!(loaded.identity_key_pair(), store.identity_key_pair());
        assert_eq!(loaded.signed_key_pair().id, 6);
    }

    #[test]
    fn delete_removes_snapshot_but_not_memory() {
        let provider = memory();
        let store = KeyStore::create(30, provider.clone()).unwrap();
        store.dispose().unwrap();
        assert_eq!(provider.known_ids().unwrap(), vec![30]);

        store.delete().unwrap();
        assert!(provider.read(ControllerKind::Keys, 30).unwrap().is_none());
        assert_eq!(store.id(), 30);
    }
}
