//! Encryption at rest for the credential file.
//!
//! Sealed layout: `MQS1` magic, 16-byte salt, 12-byte nonce, ciphertext.
//! The key is derived from the store secret with Argon2id over the salt.

use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

const MAGIC: &[u8; 4] = b"MQS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;

/// Argon2 memory cost in KiB.
/// The secret is random, not a password, so a modest cost is enough.
const KDF_MEMORY_KIB: u32 = 8 * 1024;
const KDF_ITERATIONS: u32 = 2;

pub struct StoreCipher {
    secret: Vec<u8>,
    /// Salt and the key derived from it, reused across writes
    derived: Mutex<Option<([u8; SALT_LEN], [u8; KEY_LEN])>>,
}

impl StoreCipher {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            derived: Mutex::new(None),
        }
    }

    fn derive_key(&self, salt: &[u8; SALT_LEN]) -> Result<[u8; KEY_LEN]> {
        let mut cached = self.derived.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((cached_salt, key)) = cached.as_ref() {
            if cached_salt == salt {
                return Ok(*key);
            }
        }

        let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, 1, Some(KEY_LEN))
            .map_err(|e| anyhow!("Invalid key derivation parameters: {}", e))?;
        let mut key = [0u8; KEY_LEN];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(&self.secret, salt, &mut key)
            .map_err(|e| anyhow!("Failed to derive credential key: {}", e))?;

        *cached = Some((*salt, key));
        Ok(key)
    }

    fn current_salt(&self) -> [u8; SALT_LEN] {
        let cached = self.derived.lock().unwrap_or_else(|p| p.into_inner());
        match cached.as_ref() {
            Some((salt, _)) => *salt,
            None => {
                let mut salt = [0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                salt
            }
        }
    }

    /// Encrypt `plaintext` with a fresh nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let salt = self.current_salt();
        let key = self.derive_key(&salt)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("Failed to encrypt credentials"))?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        sealed.extend_from_slice(MAGIC);
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt data produced by [`StoreCipher::seal`] with the same secret
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < HEADER_LEN || &sealed[..MAGIC.len()] != MAGIC {
            bail!("Credential file is not in the expected format");
        }
        let (salt_bytes, rest) = sealed[MAGIC.len()..].split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(salt_bytes);
        let key = self.derive_key(&salt)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt credentials (wrong key or corrupted file)"))
    }
}
