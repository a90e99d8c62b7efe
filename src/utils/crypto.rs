use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::utils::{LanError, Result};

pub const SALT_SIZE: usize = 8;
pub const IV_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
const PBKDF2_ROUNDS: u32 = 10_000;
const HASH_BUF_SIZE: usize = 8192;

/// Minimum length of a valid encrypted blob: salt + IV + GCM tag.
pub const MIN_BLOB_SIZE: usize = SALT_SIZE + IV_SIZE + TAG_SIZE;

/// Derive a 32-byte AES key and a 12-byte IV from a password and salt
/// with PBKDF2-HMAC-SHA256.
fn derive_key_iv(password: &str, salt: &[u8]) -> ([u8; KEY_SIZE], [u8; IV_SIZE]) {
    let mut output = [0u8; KEY_SIZE + IV_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut output);

    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    key.copy_from_slice(&output[..KEY_SIZE]);
    iv.copy_from_slice(&output[KEY_SIZE..]);
    (key, iv)
}

/// Encrypt with AES-256-GCM under a password-derived key.
///
/// Output layout: `salt(8) || iv(12) || ciphertext || tag(16)`.
/// The salt is freshly random on every call.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let (key, iv) = derive_key_iv(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| LanError::Crypto("encryption failed".to_string()))?;

    let mut output = Vec::with_capacity(SALT_SIZE + IV_SIZE + ciphertext.len());
    output.extend_from_slice(&salt);
    output.extend_from_slice(&iv);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt a blob produced by [`encrypt`]. Fails on truncated input or
/// GCM authentication mismatch (wrong password or corrupted data).
pub fn decrypt(blob: &[u8], password: &str) -> Result<Vec<u8>> {
    if blob.len() < MIN_BLOB_SIZE {
        return Err(LanError::Crypto(format!(
            "encrypted blob too short: {} bytes",
            blob.len()
        )));
    }

    let salt = &blob[..SALT_SIZE];
    let iv = &blob[SALT_SIZE..SALT_SIZE + IV_SIZE];
    let ciphertext = &blob[SALT_SIZE + IV_SIZE..];

    let (key, _) = derive_key_iv(password, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| LanError::Crypto("authentication failed or corrupted data".to_string()))
}

/// Lower-case hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-256 of a file, 8 KiB reads. Lower-case hex digest.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| LanError::Io(format!("failed to open {}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
