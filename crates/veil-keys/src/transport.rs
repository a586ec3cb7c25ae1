//! AES-256-GCM framing for the encrypted transport.
//!
//! After the noise handshake the store holds one key per direction. Every
//! frame is sealed under the next write counter value and opened under the
//! next read counter value, so the counters double as nonces and must never
//! repeat under one key. The key and counter value of a frame are taken in
//! one step; a concurrent `clear` or rekey cannot split them.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

use crate::error::{MacValidationError, Result, StoreError};
use crate::identity::KEY_LENGTH;
use crate::store::KeyStore;

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

/// Nonce for the frame with `counter`: four zero bytes, then the counter
/// big-endian.
pub fn frame_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn aead_key(key: &[u8]) -> Result<LessSafeKey> {
    if key.len() != KEY_LENGTH {
        return Err(StoreError::InvalidKey(format!(
            "transport key must be {KEY_LENGTH} bytes, got {}",
            key.len()
        )));
    }
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| StoreError::InvalidKey("rejected transport key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt an outbound frame under the write key and the next write counter.
pub fn seal_frame(keys: &KeyStore, plaintext: &[u8]) -> Result<Vec<u8>> {
    let (key, counter) = keys
        .next_write_nonce()
        .ok_or(StoreError::MissingTransportKey)?;
    let key = aead_key(&key)?;

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(frame_nonce(counter)),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| StoreError::InvalidKey("frame encryption failed".into()))?;
    Ok(in_out)
}

/// Decrypt an inbound frame under the read key and the next read counter.
///
/// A tag mismatch is reported as [`StoreError::Authentication`]; the read
/// counter has advanced regardless.
pub fn open_frame(keys: &KeyStore, frame: &[u8]) -> Result<Vec<u8>> {
    let (key, counter) = keys
        .next_read_nonce()
        .ok_or(StoreError::MissingTransportKey)?;
    let key = aead_key(&key)?;
    if frame.len() < GCM_TAG_SIZE {
        return Err(MacValidationError { counter }.into());
    }

    let mut in_out = frame.to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(frame_nonce(counter)),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| MacValidationError { counter })?;
    Ok(plaintext.to_vec())
}
