//! Passphrase-based authenticated encryption.
//!
//! Every call to [`Cipher::encrypt`] draws a fresh 16-byte salt and 12-byte
//! nonce, stretches the passphrase with Argon2id over that salt and seals the
//! plaintext with ChaCha20-Poly1305. The resulting [`Envelope`] carries all
//! three values base64-encoded, so decryption needs nothing but the passphrase.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::record::{Passphrase, VaultRecord};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const DERIVED_KEY_LEN: usize = 32;

pub const KDF_MEMORY_KIB: u32 = 65536; // 64MB
pub const KDF_ITERATIONS: u32 = 3;
pub const KDF_PARALLELISM: u32 = 4;

/// Argon2id cost parameters. Fixed per deployment; changing them makes every
/// existing envelope undecryptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: KDF_MEMORY_KIB,
            iterations: KDF_ITERATIONS,
            parallelism: KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests only.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// One sealed payload: `{ciphertext, iv, salt}`, each base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Cipher {
    params: KdfParams,
}

impl Cipher {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn derive_key(
        &self,
        passphrase: &Passphrase,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(DERIVED_KEY_LEN),
        )
        .map_err(|e| VaultError::Kdf(format!("argon2 params: {e}")))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
        argon
            .hash_password_into(passphrase.expose().as_bytes(), salt, &mut key[..])
            .map_err(|e| VaultError::Kdf(format!("argon2 derive: {e}")))?;
        Ok(key)
    }

    pub fn encrypt(&self, plaintext: &[u8], passphrase: &Passphrase) -> Result<Envelope> {
        let salt = generate_salt();
        let nonce = generate_nonce();
        let key = self.derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| VaultError::EncryptionFailure)?;
        Ok(Envelope {
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
            iv: general_purpose::STANDARD.encode(nonce),
            salt: general_purpose::STANDARD.encode(salt),
        })
    }

    pub fn decrypt(&self, envelope: &Envelope, passphrase: &Passphrase) -> Result<Zeroizing<Vec<u8>>> {
        let salt = decode_field(&envelope.salt)?;
        let nonce = decode_field(&envelope.iv)?;
        let ciphertext = decode_field(&envelope.ciphertext)?;
        if salt.len() != SALT_LEN || nonce.len() != NONCE_LEN {
            return Err(VaultError::DecryptionFailure);
        }
        let key = self.derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| VaultError::DecryptionFailure)?;
        Ok(Zeroizing::new(plaintext))
    }

    pub fn seal_record(&self, record: &VaultRecord, passphrase: &Passphrase) -> Result<Envelope> {
        let plaintext = Zeroizing::new(serde_json::to_vec(record)?);
        self.encrypt(&plaintext, passphrase)
    }

    pub fn open_record(&self, envelope: &Envelope, passphrase: &Passphrase) -> Result<VaultRecord> {
        let plaintext = self.decrypt(envelope, passphrase)?;
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::DecryptionFailure)
    }
}

fn decode_field(value: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|_| VaultError::DecryptionFailure)
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
