//! Pluggable persistence for controller snapshots.
//!
//! Providers store opaque snapshot bytes per (kind, id). The provider is
//! picked by name from a [`ProviderRegistry`] built at start-up; the
//! encrypted provider reuses the PBKDF2 + AES-256-GCM envelope to protect
//! identity keys, sessions and pre-keys on disk.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::StoreConfig;
use crate::controller::{self, ControllerKind, SaveMode};
use crate::error::{Result, StoreError};

const MAGIC: &[u8; 4] = b"VENC"; // "Veil ENCrypted"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN + 4; // 53 bytes
const PBKDF2_ITERATIONS: u32 = 600_000;

/// Durable storage of snapshot bytes keyed by controller kind and client id.
pub trait PersistenceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn read(&self, kind: ControllerKind, id: u32) -> Result<Option<Vec<u8>>>;

    fn write(&self, kind: ControllerKind, id: u32, data: &[u8]) -> Result<()> {
        let sealed = self.seal(data)?;
        self.commit(kind, id, &sealed)
    }

    /// Turn snapshot bytes into the stored form. Runs outside any writer
    /// lock, so expensive work (key derivation) belongs here.
    fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// Store bytes produced by [`PersistenceProvider::seal`].
    fn commit(&self, kind: ControllerKind, id: u32, sealed: &[u8]) -> Result<()>;

    /// Remove a snapshot. Removing an absent snapshot is not an error.
    fn remove(&self, kind: ControllerKind, id: u32) -> Result<()>;

    fn known_ids(&self) -> Result<Vec<u32>>;
}

// ── Plain files ─────────────────────────────────────────────────────────

/// Stores snapshots as `<root>/<id>/<kind file>`.
#[derive(Debug, Clone)]
pub struct FileProvider {
    root: PathBuf,
}

impl FileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, kind: ControllerKind, id: u32) -> PathBuf {
        self.root.join(id.to_string()).join(kind.file_name())
    }
}

impl PersistenceProvider for FileProvider {
    fn name(&self) -> &str {
        "default"
    }

    fn read(&self, kind: ControllerKind, id: u32) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(kind, id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically (write to .tmp, then rename).
    fn commit(&self, kind: ControllerKind, id: u32, data: &[u8]) -> Result<()> {
        let path = self.path(kind, id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp_path = path.with_extension("bin.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove(&self, kind: ControllerKind, id: u32) -> Result<()> {
        let path = self.path(kind, id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop the id directory once no kind is left in it.
        let dir = self.root.join(id.to_string());
        let empty = ControllerKind::ALL
            .into_iter()
            .all(|kind| !self.path(kind, id).exists());
        if empty {
            let _ = fs::remove_dir(&dir);
        }
        Ok(())
    }

    fn known_ids(&self) -> Result<Vec<u32>> {
        controller::known_ids(&self.root)
    }
}

// ── Encrypted files ─────────────────────────────────────────────────────

/// File provider whose snapshots are sealed with a password-derived key.
pub struct EncryptedFileProvider {
    files: FileProvider,
    password: Zeroizing<String>,
}

impl EncryptedFileProvider {
    pub fn new(root: impl Into<PathBuf>, password: Zeroizing<String>) -> Self {
        Self {
            files: FileProvider::new(root),
            password,
        }
    }
}

impl PersistenceProvider for EncryptedFileProvider {
    fn name(&self) -> &str {
        "encrypted"
    }

    fn read(&self, kind: ControllerKind, id: u32) -> Result<Option<Vec<u8>>> {
        match self.files.read(kind, id)? {
            Some(sealed) => Ok(Some(open_snapshot(&sealed, &self.password)?)),
            None => Ok(None),
        }
    }

    fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        seal_snapshot(data, &self.password)
    }

    fn commit(&self, kind: ControllerKind, id: u32, sealed: &[u8]) -> Result<()> {
        self.files.commit(kind, id, sealed)
    }

    fn remove(&self, kind: ControllerKind, id: u32) -> Result<()> {
        self.files.remove(kind, id)
    }

    fn known_ids(&self) -> Result<Vec<u32>> {
        self.files.known_ids()
    }
}

/// Derive a 256-bit AES-GCM key from password and salt.
fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> Result<LessSafeKey> {
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
        .ok_or_else(|| StoreError::Config("PBKDF2 iterations must be non-zero".into()))?;
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key_bytes[..],
    );
    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes[..])
        .map_err(|_| StoreError::InvalidKey("AES-256-GCM key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn envelope_aad() -> [u8; 5] {
    let mut aad_bytes = [0u8; 5];
    aad_bytes[..4].copy_from_slice(MAGIC);
    aad_bytes[4] = VERSION;
    aad_bytes
}

/// Encrypt snapshot bytes for disk storage.
///
/// File format: [VENC magic(4)] [version(1)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
pub fn seal_snapshot(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| StoreError::InvalidKey("RNG failed".into()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| StoreError::InvalidKey("RNG failed".into()))?;

    let key = derive_key(password, &salt)?;
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&envelope_aad()),
        &mut in_out,
    )
    .map_err(|_| StoreError::Snapshot("encryption failed".into()))?;

    let payload_len = u32::try_from(in_out.len())
        .map_err(|_| StoreError::Snapshot("snapshot too large".into()))?;
    let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
    file_data.extend_from_slice(MAGIC);
    file_data.push(VERSION);
    file_data.extend_from_slice(&salt);
    file_data.extend_from_slice(&nonce_bytes);
    file_data.extend_from_slice(&payload_len.to_be_bytes());
    file_data.extend_from_slice(&in_out);

    Ok(file_data)
}

/// Decrypt snapshot bytes sealed by [`seal_snapshot`].
pub fn open_snapshot(file_data: &[u8], password: &str) -> Result<Vec<u8>> {
    if file_data.len() < HEADER_LEN {
        return Err(StoreError::Snapshot("file too short".into()));
    }
    if &file_data[0..4] != MAGIC {
        return Err(StoreError::Snapshot(
            "invalid file format (expected VENC header)".into(),
        ));
    }
    if file_data[4] != VERSION {
        return Err(StoreError::Snapshot("unsupported file version".into()));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&file_data[5..5 + SALT_LEN]);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&file_data[37..37 + NONCE_LEN]);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&file_data[49..53]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if file_data.len() < HEADER_LEN + payload_len {
        return Err(StoreError::Snapshot("file truncated".into()));
    }

    let key = derive_key(password, &salt)?;
    let mut ciphertext = file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&envelope_aad()),
            &mut ciphertext,
        )
        .map_err(|_| StoreError::Snapshot("incorrect password or corrupted file".into()))?;

    Ok(plaintext.to_vec())
}

// ── Memory ──────────────────────────────────────────────────────────────

/// Keeps snapshots in process memory only.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    snapshots: DashMap<(ControllerKind, u32), Vec<u8>>,
}

impl PersistenceProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn read(&self, kind: ControllerKind, id: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshots.get(&(kind, id)).map(|entry| entry.value().clone()))
    }

    fn commit(&self, kind: ControllerKind, id: u32, data: &[u8]) -> Result<()> {
        self.snapshots.insert((kind, id), data.to_vec());
        Ok(())
    }

    fn remove(&self, kind: ControllerKind, id: u32) -> Result<()> {
        self.snapshots.remove(&(kind, id));
        Ok(())
    }

    fn known_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self.snapshots.iter().map(|entry| entry.key().1).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

// ── Registry ────────────────────────────────────────────────────────────

pub type ProviderFactory =
    Box<dyn Fn(&StoreConfig) -> Result<Arc<dyn PersistenceProvider>> + Send + Sync>;

/// Named provider factories. The provider is chosen explicitly by the
/// `provider` configuration value.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the built-in "default", "encrypted" and "memory" providers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("default", |config| {
            Ok(Arc::new(FileProvider::new(&config.root)) as Arc<dyn PersistenceProvider>)
        });
        registry.register("encrypted", |config| {
            let password = config.password.clone().ok_or_else(|| {
                StoreError::Config("the encrypted provider requires a password".into())
            })?;
            Ok(Arc::new(EncryptedFileProvider::new(&config.root, password))
                as Arc<dyn PersistenceProvider>)
        });
        registry.register("memory", |_| {
            Ok(Arc::new(MemoryProvider::default()) as Arc<dyn PersistenceProvider>)
        });
        registry
    }

    /// Register (or replace) a factory under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StoreConfig) -> Result<Arc<dyn PersistenceProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn resolve(&self, config: &StoreConfig) -> Result<Arc<dyn PersistenceProvider>> {
        let factory = self
            .factories
            .get(&config.provider)
            .ok_or_else(|| StoreError::UnknownProvider(config.provider.clone()))?;
        factory(config)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

// ── Snapshot writer ─────────────────────────────────────────────────────

/// Orders the snapshot writes of one controller.
///
/// A save takes its generation number first and captures the snapshot
/// after, so a higher generation always holds every mutation that preceded
/// a lower one. A write never replaces a newer generation.
///
/// Background saves share one pending slot that holds only the newest
/// snapshot, drained by at most one worker at a time. A burst of mutations
/// therefore costs a handful of writes, not one per mutation.
pub(crate) struct SnapshotWriter {
    provider: Arc<dyn PersistenceProvider>,
    kind: ControllerKind,
    id: u32,
    shared: Arc<WriterState>,
}

#[derive(Default)]
struct WriterState {
    scheduled: AtomicU64,
    written: Mutex<u64>,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    latest: Option<(u64, Vec<u8>)>,
    worker: bool,
}

impl SnapshotWriter {
    pub(crate) fn new(provider: Arc<dyn PersistenceProvider>, kind: ControllerKind, id: u32) -> Self {
        Self {
            provider,
            kind,
            id,
            shared: Arc::new(WriterState::default()),
        }
    }

    pub(crate) fn provider(&self) -> &Arc<dyn PersistenceProvider> {
        &self.provider
    }

    /// Take the next generation, then call `capture` for the bytes to store.
    pub(crate) fn write_with<F>(&self, capture: F, mode: SaveMode) -> Result<()>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        let generation = self.shared.scheduled.fetch_add(1, Ordering::SeqCst) + 1;
        let data = capture()?;
        match mode {
            SaveMode::Sync => write_generation(
                self.provider.as_ref(),
                &self.shared,
                self.kind,
                self.id,
                generation,
                &data,
            ),
            SaveMode::Async => {
                if self.shared.enqueue(generation, data) {
                    self.spawn_worker();
                }
                Ok(())
            }
        }
    }

    fn spawn_worker(&self) {
        let provider = self.provider.clone();
        let shared = self.shared.clone();
        let (kind, id) = (self.kind, self.id);
        let job = move || {
            while let Some((generation, data)) = shared.next_pending() {
                if let Err(e) =
                    write_generation(provider.as_ref(), &shared, kind, id, generation, &data)
                {
                    warn!(id, ?kind, generation, "background snapshot write failed: {e}");
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }

    /// Remove the snapshot and cancel every write scheduled so far.
    pub(crate) fn remove(&self) -> Result<()> {
        let mut written = lock(&self.shared.written);
        *written = self.shared.scheduled.load(Ordering::SeqCst);
        lock(&self.shared.pending).latest = None;
        self.provider.remove(self.kind, self.id)
    }
}

impl WriterState {
    /// Keep `data` if it is newer than the pending snapshot. Returns true
    /// when the caller must start a worker.
    fn enqueue(&self, generation: u64, data: Vec<u8>) -> bool {
        let mut pending = lock(&self.pending);
        if pending
            .latest
            .as_ref()
            .map_or(true, |(queued, _)| *queued < generation)
        {
            pending.latest = Some((generation, data));
        }
        !std::mem::replace(&mut pending.worker, true)
    }

    /// Next snapshot for the worker; `None` retires the worker.
    fn next_pending(&self) -> Option<(u64, Vec<u8>)> {
        let mut pending = lock(&self.pending);
        let next = pending.latest.take();
        if next.is_none() {
            pending.worker = false;
        }
        next
    }
}

fn write_generation(
    provider: &dyn PersistenceProvider,
    shared: &WriterState,
    kind: ControllerKind,
    id: u32,
    generation: u64,
    data: &[u8],
) -> Result<()> {
    if *lock(&shared.written) >= generation {
        debug!(id, ?kind, generation, "skipping superseded snapshot");
        return Ok(());
    }
    let sealed = provider.seal(data)?;

    let mut written = lock(&shared.written);
    if *written >= generation {
        debug!(id, ?kind, generation, "skipping superseded snapshot");
        return Ok(());
    }
    provider.commit(kind, id, &sealed)?;
    *written = generation;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
