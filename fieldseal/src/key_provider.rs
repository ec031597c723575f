//! Master key provider abstraction.
//!
//! A master key provider wraps and unwraps data keys. The provider never
//! sees field values; it only protects the 96-byte data key material.
//! Where a data key was wrapped is recorded in its key vault document as
//! [`MasterKey`] coordinates, and the key manager picks the provider whose
//! [`ProviderKind`] matches.

use crate::config::LocalProviderConfig;
use crate::error::{Error, KeyProviderError};
use crate::kdf::derive_local_kek;
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Associated data bound into locally wrapped keys.
const LOCAL_WRAP_AAD: &[u8] = b"fieldseal/data-key";

/// Backend family of a master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Master key held by the application.
    Local,
    /// Master key held by AWS KMS.
    Aws,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Aws => f.write_str("aws"),
        }
    }
}

/// Coordinates of the master key that wraps a data key.
///
/// Serialized as the `masterKey` field of a key vault document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum MasterKey {
    /// The local master key configured for this client.
    #[serde(rename = "local")]
    Local,
    /// An AWS KMS key.
    #[serde(rename = "aws", alias = "remote")]
    Aws {
        /// AWS region of the key.
        region: String,
        /// Key ARN or alias.
        key: String,
        /// Custom KMS endpoint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl MasterKey {
    /// Coordinates for an AWS KMS key.
    #[must_use]
    pub fn aws(region: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Aws { region: region.into(), key: key.into(), endpoint: None }
    }

    /// Provider family responsible for these coordinates.
    #[must_use]
    pub const fn provider(&self) -> ProviderKind {
        match self {
            Self::Local => ProviderKind::Local,
            Self::Aws { .. } => ProviderKind::Aws,
        }
    }
}

/// Wraps and unwraps data keys under a master key.
///
/// Implementations must be thread-safe (`Send + Sync`) to support
/// concurrent document transforms.
///
/// # Example
///
/// ```rust,ignore
/// use fieldseal::key_provider::{MasterKey, MasterKeyProvider, ProviderKind};
///
/// struct MyProvider;
///
/// #[async_trait::async_trait]
/// impl MasterKeyProvider for MyProvider {
///     fn kind(&self) -> ProviderKind {
///         ProviderKind::Aws
///     }
///     // ... wrap_dek, unwrap_dek
/// }
/// ```
#[async_trait]
pub trait MasterKeyProvider: Send + Sync {
    /// Provider family this implementation serves.
    fn kind(&self) -> ProviderKind;

    /// Wraps (encrypts) data key material under `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::WrapFailed` if wrapping fails and
    /// `KeyProviderError::InvalidMasterKey` if the coordinates belong to a
    /// different provider.
    async fn wrap_dek(&self, master_key: &MasterKey, dek: &[u8])
        -> Result<Vec<u8>, KeyProviderError>;

    /// Unwraps (decrypts) data key material previously wrapped under `master_key`.
    ///
    /// # Returns
    ///
    /// Returns the plaintext key in a `SecretVec` for memory safety.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::UnwrapFailed` or
    /// `KeyProviderError::AccessDenied` if unwrapping fails.
    async fn unwrap_dek(
        &self,
        master_key: &MasterKey,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError>;
}

/// Provider backed by a 96-byte master key held by the application.
///
/// Data keys are wrapped with ChaCha20-Poly1305 under a key derived from
/// the master key: `[nonce:12][ciphertext][tag:16]`.
pub struct LocalKeyProvider {
    kek: SecretVec<u8>,
}

impl LocalKeyProvider {
    /// Creates a provider from raw master key bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` unless the master key is 96 bytes.
    pub fn new(master_key: &SecretVec<u8>) -> Result<Self, Error> {
        Ok(Self { kek: derive_local_kek(master_key)? })
    }

    /// Creates a provider from its configuration entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid base64 and
    /// `Error::InvalidKeyLength` for a key that is not 96 bytes.
    pub fn from_config(config: &LocalProviderConfig) -> Result<Self, Error> {
        Self::new(&config.master_key()?)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, KeyProviderError> {
        ChaCha20Poly1305::new_from_slice(self.kek.expose_secret())
            .map_err(|e| KeyProviderError::InvalidMasterKey(format!("invalid KEK: {e}")))
    }
}

fn expect_local(master_key: &MasterKey) -> Result<(), KeyProviderError> {
    match master_key {
        MasterKey::Local => Ok(()),
        other => Err(KeyProviderError::InvalidMasterKey(format!(
            "local provider cannot use `{}` master keys",
            other.provider()
        ))),
    }
}

#[async_trait]
impl MasterKeyProvider for LocalKeyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn wrap_dek(
        &self,
        master_key: &MasterKey,
        dek: &[u8],
    ) -> Result<Vec<u8>, KeyProviderError> {
        expect_local(master_key)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let sealed = self
            .cipher()?
            .encrypt(&nonce, Payload { msg: dek, aad: LOCAL_WRAP_AAD })
            .map_err(|e| KeyProviderError::WrapFailed(format!("ChaCha20-Poly1305: {e}")))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + sealed.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    async fn unwrap_dek(
        &self,
        master_key: &MasterKey,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        expect_local(master_key)?;

        if wrapped_dek.len() < NONCE_SIZE {
            return Err(KeyProviderError::UnwrapFailed("wrapped key truncated".to_string()));
        }
        let (nonce_bytes, sealed) = wrapped_dek.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let dek = self
            .cipher()?
            .decrypt(nonce, Payload { msg: sealed, aad: LOCAL_WRAP_AAD })
            .map_err(|_| {
                KeyProviderError::UnwrapFailed(
                    "authentication failed: wrong master key or corrupted key material".to_string(),
                )
            })?;

        Ok(SecretVec::new(dek))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(fill: u8) -> LocalKeyProvider {
        LocalKeyProvider::new(&SecretVec::new(vec![fill; 96])).unwrap()
    }

    #[tokio::test]
    async fn test_local_wrap_unwrap() {
        let provider = provider(7);
        let dek = vec![42u8; 96];

        let wrapped = provider.wrap_dek(&MasterKey::Local, &dek).await.unwrap();
        assert_eq!(wrapped.len(), NONCE_SIZE + 96 + 16);
        assert_ne!(&wrapped[NONCE_SIZE..NONCE_SIZE + 96], dek.as_slice());

        let unwrapped = provider.unwrap_dek(&MasterKey::Local, &wrapped).await.unwrap();
        assert_eq!(unwrapped.expose_secret(), &dek);
    }

    #[tokio::test]
    async fn test_local_wrap_is_randomized() {
        let provider = provider(7);
        let a = provider.wrap_dek(&MasterKey::Local, &[1; 96]).await.unwrap();
        let b = provider.wrap_dek(&MasterKey::Local, &[1; 96]).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_wrong_master_key_fails() {
        let wrapped = provider(1).wrap_dek(&MasterKey::Local, &[5; 96]).await.unwrap();
        let result = provider(2).unwrap_dek(&MasterKey::Local, &wrapped).await;
        assert!(matches!(result, Err(KeyProviderError::UnwrapFailed(_))));
    }

    #[tokio::test]
    async fn test_truncated_wrapped_key_fails() {
        let result = provider(1).unwrap_dek(&MasterKey::Local, &[0; 4]).await;
        assert!(matches!(result, Err(KeyProviderError::UnwrapFailed(_))));
    }

    #[tokio::test]
    async fn test_local_rejects_remote_coordinates() {
        let key = MasterKey::aws("us-east-1", "arn:aws:kms:us-east-1:123456789012:key/abc");
        let result = provider(1).wrap_dek(&key, &[0; 96]).await;
        assert!(matches!(result, Err(KeyProviderError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_master_key_serde() {
        assert_eq!(serde_json::to_value(MasterKey::Local).unwrap(), json!({ "provider": "local" }));

        let aws = MasterKey::aws("eu-west-1", "alias/patients");
        assert_eq!(
            serde_json::to_value(&aws).unwrap(),
            json!({ "provider": "aws", "region": "eu-west-1", "key": "alias/patients" })
        );

        let parsed: MasterKey = serde_json::from_value(
            json!({ "provider": "remote", "region": "eu-west-1", "key": "alias/patients" }),
        )
        .unwrap();
        assert_eq!(parsed, aws);
        assert_eq!(parsed.provider(), ProviderKind::Aws);
    }

    #[tokio::test]
    async fn test_from_config_matches_raw_key() {
        let config = LocalProviderConfig::from_bytes(&[7; 96]);
        let from_config = LocalKeyProvider::from_config(&config).unwrap();

        let wrapped = provider(7).wrap_dek(&MasterKey::Local, &[9; 96]).await.unwrap();
        let unwrapped = from_config.unwrap_dek(&MasterKey::Local, &wrapped).await.unwrap();
        assert_eq!(unwrapped.expose_secret(), &vec![9u8; 96]);
    }

    #[test]
    fn test_local_requires_96_byte_master_key() {
        assert!(LocalKeyProvider::new(&SecretVec::new(vec![0; 32])).is_err());
    }
}
