use anyhow::Result;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// 32-byte instance encryption key, persisted as `wagate.key` in the data dir.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Ciphertext plus the per-value nonce it was sealed with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
}

/// Generate a fresh random encryption key.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Load a key from raw bytes. Returns `None` unless exactly 32 bytes are given.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; 32] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

/// Encrypt `plaintext` with `key` under a random nonce.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Sealed> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Decrypt a value produced by [`seal`].
pub fn open(key: &EncryptionKey, sealed: &Sealed) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from(sealed.nonce);

    let plaintext = cipher
        .decrypt(&nonce, sealed.ciphertext.as_slice())
        .map_err(|e| anyhow::anyhow!("decrypt: {e}"))?;

    Ok(plaintext)
}
