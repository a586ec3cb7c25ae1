//! Veil key layer: the client's Signal key material and its persistence.
//!
//! This crate provides:
//! - The key store: identity, signed pre-key, one-time pre-keys and companion data
//! - Pairwise sessions and group sender keys, as libsignal stores
//! - App-state sync keys and LT-hash states
//! - Transport frame encryption under the handshake keys
//! - Pluggable, optionally encrypted snapshot persistence
//! - The failure policy deciding when a session is rebuilt

pub mod app_state;
pub mod config;
pub mod controller;
pub mod error;
pub mod failure;
pub mod group;
pub mod identity;
pub mod persistence;
pub mod prekey;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod stores;
pub mod transport;
pub mod trust;

// Re-export key types for convenience
pub use app_state::{AppStateSyncKey, LtHashState, SyncType};
pub use config::StoreConfig;
pub use controller::{Controller, ControllerKind, SaveMode};
pub use error::{MacValidationError, Result, StoreError};
pub use failure::{DefaultFailureHandler, FailureHandler, Location};
pub use group::{SenderKeyName, SenderKeyRecord};
pub use identity::{CompanionId, SerializableKeyPair, SignedDeviceIdentity, SignedKeyPair};
pub use persistence::{PersistenceProvider, ProviderRegistry};
pub use prekey::{PreKeyEntry, SerializablePreKey};
pub use session::{Session, SessionAddress};
pub use store::{KeyMaterial, KeyStore};
pub use stores::ProtocolStore;
pub use trust::{AlwaysTrust, TrustPolicy};
