//! AWS KMS master key provider for `fieldseal`.
//!
//! Data keys are wrapped with KMS `Encrypt` and unwrapped with KMS `Decrypt`
//! under the key named by the data key's [`MasterKey::Aws`] coordinates.
//! One KMS client is kept per region (and custom endpoint).
//!
//! # Example
//!
//! ```rust,no_run
//! use fieldseal::prelude::*;
//! use fieldseal_kms_aws::AwsKmsProvider;
//! use std::sync::Arc;
//!
//! # async fn example(options: EncryptionOptions) -> Result<(), Box<dyn std::error::Error>> {
//! let remote = options.remote().ok_or("no remote provider configured")?;
//! let aws: Arc<dyn MasterKeyProvider> = Arc::new(AwsKmsProvider::from_config(remote));
//!
//! let encrypter =
//!     AutoEncrypter::from_options(&options, Arc::new(InMemoryKeyVault::new()), [aws])?;
//! let key_id = encrypter
//!     .client_encryption()
//!     .create_data_key(MasterKey::aws("eu-west-1", "alias/patients"))
//!     .await?;
//! # let _ = key_id;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use async_trait::async_trait;
use aws_sdk_kms::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use fieldseal::config::RemoteProviderConfig;
use fieldseal::error::KeyProviderError;
use fieldseal::key_provider::{MasterKey, MasterKeyProvider, ProviderKind};
use secrecy::{ExposeSecret, SecretVec};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors specific to AWS KMS operations.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// IAM denied the KMS call
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The KMS key does not exist or is not visible to the caller
    #[error("KMS key not found: {0}")]
    KeyNotFound(String),

    /// KMS rejected the wrapped key
    #[error("invalid ciphertext for KMS key {0}")]
    InvalidCiphertext(String),

    /// KMS Encrypt failed
    #[error("KMS encrypt failed: {0}")]
    Encrypt(String),

    /// KMS Decrypt failed
    #[error("KMS decrypt failed: {0}")]
    Decrypt(String),

    /// The coordinates belong to another provider
    #[error("not an AWS master key (provider `{0}`)")]
    WrongProvider(ProviderKind),
}

impl From<AwsKmsError> for KeyProviderError {
    fn from(err: AwsKmsError) -> Self {
        match err {
            AwsKmsError::AccessDenied(msg) => Self::AccessDenied(msg),
            AwsKmsError::KeyNotFound(_) | AwsKmsError::WrongProvider(_) => {
                Self::InvalidMasterKey(err.to_string())
            }
            AwsKmsError::Encrypt(msg) => Self::WrapFailed(msg),
            AwsKmsError::InvalidCiphertext(_) => Self::UnwrapFailed(err.to_string()),
            AwsKmsError::Decrypt(msg) => Self::UnwrapFailed(msg),
        }
    }
}

type ClientKey = (String, Option<String>);

/// AWS KMS master key provider.
pub struct AwsKmsProvider {
    credentials: Option<Credentials>,
    endpoint: Option<String>,
    clients: RwLock<HashMap<ClientKey, KmsClient>>,
}

impl AwsKmsProvider {
    /// Creates a provider using the SDK's default credential chain
    /// (environment, profile, instance role).
    #[must_use]
    pub fn from_env() -> Self {
        Self { credentials: None, endpoint: None, clients: RwLock::new(HashMap::new()) }
    }

    /// Creates a provider with static credentials from configuration.
    #[must_use]
    pub fn from_config(config: &RemoteProviderConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.expose_secret().clone(),
            config.session_token.as_ref().map(|t| t.expose_secret().clone()),
            None,
            "fieldseal",
        );
        Self {
            credentials: Some(credentials),
            endpoint: config.endpoint.clone(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Uses a pre-built client for `region`.
    #[must_use]
    pub fn with_client(mut self, region: impl Into<String>, client: KmsClient) -> Self {
        let key = (region.into(), self.endpoint.clone());
        self.clients.get_mut().insert(key, client);
        self
    }

    /// Number of KMS clients built so far.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn client(&self, region: &str, endpoint: Option<&str>) -> KmsClient {
        let endpoint = endpoint.map(str::to_string).or_else(|| self.endpoint.clone());
        let key = (region.to_string(), endpoint);
        if let Some(client) = self.clients.read().await.get(&key) {
            return client.clone();
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(&key) {
            return client.clone();
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(key.0.clone()));
        if let Some(credentials) = &self.credentials {
            loader = loader.credentials_provider(credentials.clone());
        }
        if let Some(url) = &key.1 {
            loader = loader.endpoint_url(url.clone());
        }
        let client = KmsClient::new(&loader.load().await);

        debug!("created KMS client for region {}", key.0);
        clients.insert(key, client.clone());
        client
    }
}

fn coordinates(master_key: &MasterKey) -> Result<(&str, &str, Option<&str>), AwsKmsError> {
    match master_key {
        MasterKey::Aws { region, key, endpoint } => {
            Ok((region.as_str(), key.as_str(), endpoint.as_deref()))
        }
        other => Err(AwsKmsError::WrongProvider(other.provider())),
    }
}

fn classify<E>(
    err: &SdkError<E>,
    key: &str,
    fallback: fn(String) -> AwsKmsError,
) -> AwsKmsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match err.code() {
        Some("AccessDeniedException") => {
            AwsKmsError::AccessDenied(DisplayErrorContext(err).to_string())
        }
        Some("NotFoundException") => AwsKmsError::KeyNotFound(key.to_string()),
        Some("InvalidCiphertextException" | "IncorrectKeyException") => {
            AwsKmsError::InvalidCiphertext(key.to_string())
        }
        _ => fallback(DisplayErrorContext(err).to_string()),
    }
}

#[async_trait]
impl MasterKeyProvider for AwsKmsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    async fn wrap_dek(
        &self,
        master_key: &MasterKey,
        dek: &[u8],
    ) -> Result<Vec<u8>, KeyProviderError> {
        let (region, key, endpoint) = coordinates(master_key)?;
        let client = self.client(region, endpoint).await;

        let output = client
            .encrypt()
            .key_id(key)
            .plaintext(Blob::new(dek.to_vec()))
            .send()
            .await
            .map_err(|e| classify(&e, key, AwsKmsError::Encrypt))?;

        let wrapped = output
            .ciphertext_blob()
            .ok_or_else(|| AwsKmsError::Encrypt("no ciphertext returned".to_string()))?;
        Ok(wrapped.as_ref().to_vec())
    }

    async fn unwrap_dek(
        &self,
        master_key: &MasterKey,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        let (region, key, endpoint) = coordinates(master_key)?;
        let client = self.client(region, endpoint).await;

        let output = client
            .decrypt()
            .key_id(key)
            .ciphertext_blob(Blob::new(wrapped_dek.to_vec()))
            .send()
            .await
            .map_err(|e| classify(&e, key, AwsKmsError::Decrypt))?;

        let plaintext = output
            .plaintext()
            .ok_or_else(|| AwsKmsError::Decrypt("no plaintext returned".to_string()))?;
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}
