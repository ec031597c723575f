//! Client-facing entry points.
//!
//! [`ClientEncryption`] encrypts single values explicitly and manages data
//! keys. [`AutoEncrypter`] applies per-namespace schemas to whole documents.

use crate::cipher;
use crate::config::EncryptionOptions;
use crate::error::{Error, Result};
use crate::header::CiphertextEnvelope;
use crate::key_manager::EnvelopeKeyManager;
use crate::key_provider::{MasterKey, MasterKeyProvider};
use crate::key_vault::KeyVault;
use crate::pipeline;
use crate::schema::{Algorithm, SchemaMap, ValueType};
use crate::value::{Document, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Explicit encryption and data key management.
#[derive(Clone)]
pub struct ClientEncryption {
    keys: Arc<EnvelopeKeyManager>,
}

impl ClientEncryption {
    /// Creates a client over a shared key manager.
    #[must_use]
    pub const fn new(keys: Arc<EnvelopeKeyManager>) -> Self {
        Self { keys }
    }

    /// The underlying key manager.
    #[must_use]
    pub const fn key_manager(&self) -> &Arc<EnvelopeKeyManager> {
        &self.keys
    }

    /// Creates a data key wrapped under `master_key`.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeKeyManager::create_data_key`].
    pub async fn create_data_key(&self, master_key: MasterKey) -> Result<Uuid> {
        self.keys.create_data_key(master_key).await
    }

    /// Re-wraps a data key under a new master key.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeKeyManager::rewrap_data_key`].
    pub async fn rewrap_data_key(&self, key_id: Uuid, master_key: MasterKey) -> Result<()> {
        self.keys.rewrap_data_key(key_id, master_key).await
    }

    /// Deletes a data key.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeKeyManager::delete_data_key`].
    pub async fn delete_data_key(&self, key_id: Uuid) -> Result<()> {
        self.keys.delete_data_key(key_id).await
    }

    /// Drops a data key from the cache.
    pub async fn evict(&self, key_id: Uuid) -> bool {
        self.keys.evict(key_id).await
    }

    /// Encrypts one value.
    ///
    /// With `Deterministic` and no `value_type`, the type is inferred from
    /// the value; only deterministic-capable types are accepted.
    ///
    /// # Errors
    ///
    /// Returns key manager errors and the errors of [`cipher::encrypt_explicit`].
    pub async fn encrypt(
        &self,
        value: &Value,
        key_id: Uuid,
        algorithm: Algorithm,
        value_type: Option<ValueType>,
    ) -> Result<Value> {
        let key = self.keys.get_data_key(key_id).await?;
        let blob = cipher::encrypt_explicit(&key, key_id, algorithm, value_type, value)?;
        Ok(Value::encrypted(blob))
    }

    /// Decrypts one encrypted value.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if `value` is not an encrypted blob,
    /// plus key manager and cipher errors.
    pub async fn decrypt(&self, value: &Value) -> Result<Value> {
        let blob = value.as_encrypted().ok_or_else(|| {
            Error::DecryptionFailed(format!("expected an encrypted value, found {}", value.type_name()))
        })?;
        let envelope = CiphertextEnvelope::from_bytes(blob)?;
        let key = self.keys.get_data_key(envelope.key_id()).await?;
        cipher::decrypt_value(&key, &envelope)
    }
}

/// Schema-driven document encryption keyed by namespace.
#[derive(Clone)]
pub struct AutoEncrypter {
    keys: Arc<EnvelopeKeyManager>,
    schemas: Arc<SchemaMap>,
}

impl AutoEncrypter {
    /// Creates an encrypter from a key manager and compiled schemas.
    #[must_use]
    pub fn new(keys: Arc<EnvelopeKeyManager>, schemas: SchemaMap) -> Self {
        Self { keys, schemas: Arc::new(schemas) }
    }

    /// Builds an encrypter from options.
    ///
    /// The local provider comes from `options`; any `extra_providers`
    /// (e.g. AWS KMS) are registered after it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if a schema fails to compile and
    /// configuration errors for an invalid local key.
    pub fn from_options(
        options: &EncryptionOptions,
        vault: Arc<dyn KeyVault>,
        extra_providers: impl IntoIterator<Item = Arc<dyn MasterKeyProvider>>,
    ) -> Result<Self> {
        let schemas = options.schema_map()?;
        let mut keys = EnvelopeKeyManager::from_options(options, vault)?;
        for provider in extra_providers {
            keys = keys.with_provider(provider);
        }
        Ok(Self::new(Arc::new(keys), schemas))
    }

    /// A [`ClientEncryption`] sharing this encrypter's key manager.
    #[must_use]
    pub fn client_encryption(&self) -> ClientEncryption {
        ClientEncryption::new(Arc::clone(&self.keys))
    }

    /// Encrypts a document bound for `namespace`.
    ///
    /// Namespaces without a schema pass through unchanged.
    ///
    /// # Errors
    ///
    /// See [`pipeline::encrypt_for_write`].
    pub async fn encrypt_for_write(&self, namespace: &str, document: &Document) -> Result<Document> {
        match self.schemas.get(namespace) {
            Some(schema) => pipeline::encrypt_for_write(&self.keys, document, &schema).await,
            None => {
                debug!("no encryption schema for {namespace}");
                Ok(document.clone())
            }
        }
    }

    /// Decrypts every encrypted value in a document read from the store.
    ///
    /// # Errors
    ///
    /// See [`pipeline::decrypt_for_read`].
    pub async fn decrypt_for_read(&self, document: &Document) -> Result<Document> {
        pipeline::decrypt_for_read(&self.keys, document).await
    }
}
