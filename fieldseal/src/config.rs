//! Client configuration.
//!
//! ```json
//! {
//!   "kmsProviders": [
//!     { "provider": "local", "key": "<base64, 96 bytes>" },
//!     { "provider": "remote", "region": "eu-west-1",
//!       "accessKeyId": "...", "secretAccessKey": "..." }
//!   ],
//!   "schemaMap": { "medical.patients": { "bsonType": "object", ... } },
//!   "providerTimeoutMs": 10000
//! }
//! ```

use crate::error::{Error, Result};
use crate::key_provider::ProviderKind;
use crate::schema::SchemaMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use secrecy::{ExposeSecret, SecretString, SecretVec};
use serde::Deserialize;
use serde_json::Value as Json;
use std::time::Duration;

/// Default bound on each provider and key vault call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials for one master key provider.
#[derive(Debug, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Master key held by the application.
    Local(LocalProviderConfig),
    /// AWS KMS.
    #[serde(alias = "aws")]
    Remote(RemoteProviderConfig),
}

impl ProviderConfig {
    /// Provider family configured by this entry.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Local(_) => ProviderKind::Local,
            Self::Remote(_) => ProviderKind::Aws,
        }
    }
}

/// Local master key, base64-encoded.
#[derive(Debug, Deserialize)]
pub struct LocalProviderConfig {
    key: SecretString,
}

impl LocalProviderConfig {
    /// Builds a config from raw master key bytes.
    #[must_use]
    pub fn from_bytes(key: &[u8]) -> Self {
        Self { key: SecretString::new(STANDARD.encode(key)) }
    }

    /// Decodes the master key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the key is not valid base64.
    pub fn master_key(&self) -> Result<SecretVec<u8>> {
        STANDARD
            .decode(self.key.expose_secret())
            .map(SecretVec::new)
            .map_err(|e| Error::Config(format!("local master key is not valid base64: {e}")))
    }
}

/// AWS KMS credentials.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProviderConfig {
    /// Default region for clients.
    pub region: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: SecretString,
    /// Optional session token for temporary credentials.
    #[serde(default)]
    pub session_token: Option<SecretString>,
    /// Custom endpoint, e.g. a local KMS emulator.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Everything needed to build an auto-encrypting client.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionOptions {
    /// Master key provider credentials.
    pub kms_providers: Vec<ProviderConfig>,
    /// Namespace to encryption schema.
    #[serde(default)]
    pub schema_map: serde_json::Map<String, Json>,
    /// Bound on each provider and key vault call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub provider_timeout_ms: u64,
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT.as_millis() as u64
}

impl EncryptionOptions {
    /// Parses options from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on malformed JSON, a zero timeout, or a
    /// provider configured twice.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.provider_timeout_ms == 0 {
            return Err(Error::Config("providerTimeoutMs must be positive".to_string()));
        }
        for (i, entry) in self.kms_providers.iter().enumerate() {
            if self.kms_providers[..i].iter().any(|other| other.kind() == entry.kind()) {
                return Err(Error::Config(format!(
                    "provider `{}` configured more than once",
                    entry.kind()
                )));
            }
        }
        Ok(())
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Local provider settings, if configured.
    #[must_use]
    pub fn local(&self) -> Option<&LocalProviderConfig> {
        self.kms_providers.iter().find_map(|p| match p {
            ProviderConfig::Local(local) => Some(local),
            ProviderConfig::Remote(_) => None,
        })
    }

    /// AWS KMS settings, if configured.
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteProviderConfig> {
        self.kms_providers.iter().find_map(|p| match p {
            ProviderConfig::Remote(remote) => Some(remote),
            ProviderConfig::Local(_) => None,
        })
    }

    /// Compiles every schema in the schema map.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` for the first schema that fails to compile.
    pub fn schema_map(&self) -> Result<SchemaMap> {
        SchemaMap::from_json(&Json::Object(self.schema_map.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::LOCAL_MASTER_KEY_SIZE;

    fn local_key() -> String {
        STANDARD.encode([3u8; LOCAL_MASTER_KEY_SIZE])
    }

    #[test]
    fn test_parse_full_options() {
        let json = format!(
            r#"{{
                "kmsProviders": [
                    {{ "provider": "local", "key": "{}" }},
                    {{ "provider": "remote", "region": "eu-west-1",
                       "accessKeyId": "AKIAEXAMPLE", "secretAccessKey": "wJalr" }}
                ],
                "schemaMap": {{
                    "medical.patients": {{
                        "bsonType": "object",
                        "properties": {{
                            "ssn": {{ "encrypt": {{
                                "bsonType": "int",
                                "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
                                "keyId": "1f0b1c3e-3b6a-4c59-9d8a-1a2b3c4d5e6f"
                            }} }}
                        }}
                    }}
                }},
                "providerTimeoutMs": 2500
            }}"#,
            local_key()
        );

        let options = EncryptionOptions::from_json_str(&json).unwrap();
        assert_eq!(options.provider_timeout(), Duration::from_millis(2500));
        assert_eq!(
            options.local().unwrap().master_key().unwrap().expose_secret().len(),
            LOCAL_MASTER_KEY_SIZE
        );

        let remote = options.remote().unwrap();
        assert_eq!(remote.region, "eu-west-1");
        assert_eq!(remote.secret_access_key.expose_secret(), "wJalr");

        let schemas = options.schema_map().unwrap();
        assert!(schemas.get("medical.patients").is_some());
    }

    #[test]
    fn test_defaults() {
        let json = format!(r#"{{ "kmsProviders": [{{ "provider": "local", "key": "{}" }}] }}"#, local_key());
        let options = EncryptionOptions::from_json_str(&json).unwrap();

        assert_eq!(options.provider_timeout(), DEFAULT_PROVIDER_TIMEOUT);
        assert!(options.remote().is_none());
        assert!(options.schema_map().unwrap().is_empty());
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let json = r#"{ "kmsProviders": [{ "provider": "remote", "region": "us-east-1",
            "accessKeyId": "AKIA", "secretAccessKey": "topsecret" }] }"#;
        let options = EncryptionOptions::from_json_str(json).unwrap();
        assert!(!format!("{options:?}").contains("topsecret"));
    }

    #[test]
    fn test_rejects_bad_input() {
        let cases = [
            r#"{ "kmsProviders": [{ "provider": "gcp" }] }"#,
            r#"{ "kmsProviders": [], "providerTimeoutMs": 0 }"#,
            r#"{ "kmsProviders": [{ "provider": "local", "key": "AA==" },
                                  { "provider": "local", "key": "AA==" }] }"#,
            "not json",
        ];
        for case in cases {
            assert!(
                matches!(EncryptionOptions::from_json_str(case), Err(Error::Config(_))),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn test_invalid_base64_key() {
        let json = r#"{ "kmsProviders": [{ "provider": "local", "key": "!!" }] }"#;
        let options = EncryptionOptions::from_json_str(json).unwrap();
        assert!(matches!(options.local().unwrap().master_key(), Err(Error::Config(_))));
    }
}
