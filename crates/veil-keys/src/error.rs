use libsignal_protocol::SignalProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no app state keys available")]
    NoAppKeys,

    #[error("pre-key id {got} does not follow last pre-key id {last}")]
    PreKeyOutOfOrder { last: u32, got: u32 },

    #[error("cannot allocate {count} pre-key ids after {last}")]
    PreKeyIdsExhausted { last: u32, count: u32 },

    #[error("no persisted snapshot for id {0}")]
    NotPersisted(u32),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("transport key not set")]
    MissingTransportKey,

    #[error("{0}")]
    Authentication(#[from] MacValidationError),

    #[error("malformed snapshot: {0}")]
    Snapshot(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown persistence provider: {0}")]
    UnknownProvider(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("signal protocol error: {0}")]
    Signal(#[from] SignalProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// An inbound frame whose AES-GCM tag did not verify.
///
/// This is the only failure the default failure handler answers with a
/// session rebuild.
#[derive(Debug, Error)]
#[error("frame authentication failed at read counter {counter}")]
pub struct MacValidationError {
    pub counter: u64,
}
