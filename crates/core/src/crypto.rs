//! AES-256-GCM encryption for OAuth tokens stored at rest.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{Result, TrunchbullError};

/// Generate a new random 256-bit encryption key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Decode a base64 key from configuration.
pub fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TrunchbullError::Config(format!("encryption key is not base64: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        TrunchbullError::Config(format!(
            "encryption key must be 32 bytes, got {}",
            b.len()
        ))
    })
}

/// Encode a key for writing into configuration.
pub fn encode_key(key: &[u8; 32]) -> String {
    STANDARD.encode(key)
}

/// Encrypt plaintext using AES-256-GCM.
///
/// Returns nonce (12 bytes) || ciphertext.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| TrunchbullError::Crypto(format!("encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(12 + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt ciphertext produced by [`encrypt`].
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 12 {
        return Err(TrunchbullError::Crypto(
            "ciphertext too short: missing nonce".to_string(),
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(12);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| TrunchbullError::Crypto(format!("decryption failed: {e}")))
}

/// Encrypt a string and base64-encode the result for a TEXT column.
pub fn seal(key: &[u8; 32], plaintext: &str) -> Result<String> {
    Ok(STANDARD.encode(encrypt(key, plaintext.as_bytes())?))
}

/// Reverse of [`seal`].
pub fn open(key: &[u8; 32], sealed: &str) -> Result<String> {
    let data = STANDARD
        .decode(sealed)
        .map_err(|e| TrunchbullError::Crypto(format!("invalid base64: {e}")))?;
    let plain = decrypt(key, &data)?;
    String::from_utf8(plain)
        .map_err(|e| TrunchbullError::Crypto(format!("decrypted value is not UTF-8: {e}")))
}
