//! Symmetric payload encryption
//!
//! Payloads are sealed with AES-256-GCM under a fresh random key per write.
//! The on-disk form is `nonce (12 bytes) || ciphertext || tag`. The key is
//! returned to the caller and never written next to the ciphertext.
//!
//! A wrong key, a truncated file or a flipped bit all surface as
//! [`TesseraError::Crypto`], which classifies as an integrity failure.

use crate::error::{Result, TesseraError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fs;
use std::path::Path;
use tracing::trace;

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Generate a random 256-bit key
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_LEN {
        return Err(TesseraError::validation(format!(
            "secret must be {} bytes, got {}",
            KEY_LEN,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| TesseraError::crypto(format!("key init failed: {e}")))
}

/// Encrypt `plaintext`. Output: nonce || ciphertext
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| TesseraError::crypto(format!("encrypt failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`encrypt`]
pub fn decrypt(key: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;
    if blob.len() < NONCE_LEN {
        return Err(TesseraError::crypto("ciphertext too short"));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| TesseraError::crypto(format!("decrypt failed: {e}")))
}

/// Encrypt the file at `src` into `dst`
pub fn encrypt_file(src: &Path, dst: &Path, key: &[u8]) -> Result<u64> {
    let sealed = encrypt(key, &fs::read(src)?)?;
    fs::write(dst, &sealed)?;
    trace!("Encrypted {:?} -> {:?} ({} bytes)", src, dst, sealed.len());
    Ok(sealed.len() as u64)
}

/// Decrypt the file at `src` into `dst`
pub fn decrypt_file(src: &Path, dst: &Path, key: &[u8]) -> Result<u64> {
    let plain = decrypt(key, &fs::read(src)?)?;
    fs::write(dst, &plain)?;
    trace!("Decrypted {:?} -> {:?} ({} bytes)", src, dst, plain.len());
    Ok(plain.len() as u64)
}
