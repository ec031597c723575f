//! # `fieldseal`
//!
//! Schema-driven client-side field level encryption with envelope key
//! management. Selected fields are encrypted before a document leaves the
//! application and decrypted after it is read back, so the database only
//! ever stores ciphertext for them.
//!
//! ## Features
//!
//! - AEAD_AES_256_CBC_HMAC_SHA_512 per-field encryption
//! - Deterministic mode for equality matching on encrypted fields
//! - JSON-schema style encryption rules compiled once per namespace
//! - Envelope encryption: data keys wrapped by local or AWS KMS master keys
//! - Cached data keys with single-flight population and key rotation
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldseal::prelude::*;
//!
//! let options = EncryptionOptions::from_json_str(&config_json)?;
//! let vault = Arc::new(InMemoryKeyVault::new());
//! let encrypter = AutoEncrypter::from_options(&options, vault, [])?;
//!
//! let stored = encrypter.encrypt_for_write("medical.patients", &patient).await?;
//! let patient = encrypter.decrypt_for_read(&stored).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cipher;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod kdf;
pub mod key_manager;
pub mod key_provider;
pub mod key_vault;
pub mod pipeline;
pub mod schema;
pub mod value;

pub use error::{Error, ErrorKind, KeyProviderError, Result};

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::client::{AutoEncrypter, ClientEncryption};
    pub use crate::config::{EncryptionOptions, ProviderConfig};
    pub use crate::error::{Error, ErrorKind, KeyProviderError};
    pub use crate::key_manager::EnvelopeKeyManager;
    pub use crate::key_provider::{LocalKeyProvider, MasterKey, MasterKeyProvider, ProviderKind};
    pub use crate::key_vault::{InMemoryKeyVault, KeyVault, KeyVaultDocument};
    pub use crate::schema::{compile, Algorithm, CompiledSchema, SchemaMap, ValueType};
    pub use crate::value::{Document, Value};
}
