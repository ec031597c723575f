//! Data key material and key derivation.
//!
//! A data key is 96 bytes of OS randomness split into three 32-byte
//! subkeys:
//!
//! ```text
//! [encryption key:32][MAC key:32][IV derivation key:32]
//! ```
//!
//! Local master keys are never used directly as cipher keys; a wrapping key
//! is derived from them with HKDF-SHA-256.

use crate::error::Error;
use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use std::fmt;

/// Data key size in bytes.
pub const DATA_KEY_SIZE: usize = 96;

/// Size of each data key segment.
pub const SUBKEY_SIZE: usize = 32;

/// Size of a local master key in bytes.
pub const LOCAL_MASTER_KEY_SIZE: usize = 96;

/// Size of the derived local wrapping key.
pub const KEK_SIZE: usize = 32;

const LOCAL_KEK_INFO: &[u8] = b"fieldseal/local-kek/v1";

/// Unwrapped data key material.
///
/// Held only in memory, zeroized on drop.
pub struct DataKey {
    material: SecretVec<u8>,
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey").field("material", &"[REDACTED]").finish()
    }
}

impl DataKey {
    /// Generates fresh key material from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        let mut material = vec![0u8; DATA_KEY_SIZE];
        OsRng.fill_bytes(&mut material);
        Self { material: SecretVec::new(material) }
    }

    /// Wraps existing key material, checking its size.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` unless `material` is 96 bytes.
    pub fn from_secret(material: SecretVec<u8>) -> Result<Self, Error> {
        let actual = material.expose_secret().len();
        if actual != DATA_KEY_SIZE {
            return Err(Error::InvalidKeyLength { expected: DATA_KEY_SIZE, actual });
        }
        Ok(Self { material })
    }

    /// Full key material, for wrapping.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.material.expose_secret()
    }

    /// AES-256 encryption subkey.
    #[must_use]
    pub fn encryption_key(&self) -> &[u8] {
        &self.expose()[..SUBKEY_SIZE]
    }

    /// HMAC-SHA-512 authentication subkey.
    #[must_use]
    pub fn mac_key(&self) -> &[u8] {
        &self.expose()[SUBKEY_SIZE..2 * SUBKEY_SIZE]
    }

    /// Subkey used to derive deterministic IVs.
    #[must_use]
    pub fn iv_key(&self) -> &[u8] {
        &self.expose()[2 * SUBKEY_SIZE..]
    }
}

/// Derives the ChaCha20-Poly1305 wrapping key from a local master key.
///
/// # Errors
///
/// Returns `Error::InvalidKeyLength` if the master key is not 96 bytes.
pub fn derive_local_kek(master_key: &SecretVec<u8>) -> Result<SecretVec<u8>, Error> {
    let actual = master_key.expose_secret().len();
    if actual != LOCAL_MASTER_KEY_SIZE {
        return Err(Error::InvalidKeyLength { expected: LOCAL_MASTER_KEY_SIZE, actual });
    }

    let hkdf = Hkdf::<Sha256>::new(None, master_key.expose_secret());
    let mut kek = vec![0u8; KEK_SIZE];
    hkdf.expand(LOCAL_KEK_INFO, &mut kek)
        .map_err(|_| Error::EncryptionFailed("local KEK derivation failed".to_string()))?;

    Ok(SecretVec::new(kek))
}
