//! Cipher engine: AES-256-GCM encryption of backup archives.
//!
//! Envelope layout is `nonce(12) || ciphertext || tag(16)` with no header.

pub mod gcm;

use crate::config::EncryptionConfig;
use crate::utils::{BackupError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::path::{Path, PathBuf};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit key. Never printed.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key; anything other than exactly 32 bytes is a config error.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| BackupError::Config(format!("Encryption key is not valid base64: {}", e)))?;
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            BackupError::Config(format!(
                "Encryption key must decode to {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(****)")
    }
}

/// Encrypts and decrypts archive files under one static key.
#[derive(Debug, Clone)]
pub struct Cipher {
    key: EncryptionKey,
}

impl Cipher {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        Ok(Self::new(EncryptionKey::from_base64(&config.key)?))
    }

    /// Encrypt with a fresh random nonce. Returns the envelope size.
    pub fn encrypt_file(&self, input: &Path, output: &Path) -> Result<u64> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        gcm::encrypt_file(&self.key, &nonce, input, output)
    }

    /// Decrypt and authenticate. Returns the plaintext size.
    pub fn decrypt_file(&self, input: &Path, output: &Path) -> Result<u64> {
        gcm::decrypt_file(&self.key, input, output)
    }

    /// [`Cipher::encrypt_file`] on the blocking pool.
    pub async fn encrypt(&self, input: PathBuf, output: PathBuf) -> Result<u64> {
        let cipher = self.clone();
        tokio::task::spawn_blocking(move || cipher.encrypt_file(&input, &output))
            .await
            .map_err(|e| BackupError::Encryption(format!("encryption task failed: {}", e)))?
    }

    /// [`Cipher::decrypt_file`] on the blocking pool.
    pub async fn decrypt(&self, input: PathBuf, output: PathBuf) -> Result<u64> {
        let cipher = self.clone();
        tokio::task::spawn_blocking(move || cipher.decrypt_file(&input, &output))
            .await
            .map_err(|e| BackupError::Encryption(format!("decryption task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const KEY_B64: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

    #[test]
    fn test_key_from_base64() {
        let key = EncryptionKey::from_base64(KEY_B64).unwrap();
        assert_eq!(key.as_bytes()[0], 0);
        assert_eq!(key.as_bytes()[31], 31);
    }

    #[test]
    fn test_key_length_is_enforced() {
        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(EncryptionKey::from_base64(&short), Err(BackupError::Config(_))));
        assert!(matches!(EncryptionKey::from_base64("not base64!!"), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = EncryptionKey::from_base64(KEY_B64).unwrap();
        let cipher = Cipher::new(key.clone());
        assert_eq!(format!("{:?}", key), "EncryptionKey(****)");
        assert!(!format!("{:?}", cipher).contains("31"));
    }

    #[tokio::test]
    async fn test_round_trip_uses_fresh_nonces() {
        let dir = TempDir::new().unwrap();
        let cipher = Cipher::new(EncryptionKey::from_base64(KEY_B64).unwrap());
        let plain = dir.path().join("archive.tar.zst");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        fs::write(&plain, &payload).unwrap();

        let first = dir.path().join("a.enc");
        let second = dir.path().join("b.enc");
        let size = cipher.encrypt(plain.clone(), first.clone()).await.unwrap();
        cipher.encrypt(plain.clone(), second.clone()).await.unwrap();

        assert_eq!(size, payload.len() as u64 + (NONCE_LEN + TAG_LEN) as u64);
        let a = fs::read(&first).unwrap();
        let b = fs::read(&second).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);

        let restored = dir.path().join("restored.tar.zst");
        cipher.decrypt(first, restored.clone()).await.unwrap();
        assert_eq!(fs::read(&restored).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_authentication() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("p");
        let enc = dir.path().join("e");
        fs::write(&plain, b"secret dump").unwrap();
        Cipher::new(EncryptionKey::from_bytes([1u8; 32]))
            .encrypt(plain, enc.clone())
            .await
            .unwrap();

        let err = Cipher::new(EncryptionKey::from_bytes([2u8; 32]))
            .decrypt(enc, dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::AuthenticationFailed));
        assert!(!dir.path().join("out").exists());
    }
}
