//! Error types for `fieldseal` operations.

use crate::key_provider::ProviderKind;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for `fieldseal` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The encryption schema is malformed or uses unsupported features
    #[error("schema error: {0}")]
    Schema(String),

    /// No key vault record exists for the key identifier
    #[error("data key not found: {0}")]
    KeyNotFound(Uuid),

    /// Master key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(#[from] KeyProviderError),

    /// Decryption operation failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// MAC verification failed (data may be corrupted or tampered)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// Ciphertext envelope parsing failed
    #[error("invalid ciphertext envelope: {0}")]
    InvalidHeader(String),

    /// Unsupported ciphertext format version
    #[error("unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the ciphertext
        version: u8,
        /// Supported versions
        supported: String,
    },

    /// The document shape conflicts with the schema
    #[error("schema mismatch at `{path}`: {reason}")]
    SchemaMismatch {
        /// Dotted path of the offending field
        path: String,
        /// What was expected
        reason: String,
    },

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Key material has the wrong size
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// A key vault write lost a race or collided with an existing record
    #[error("key vault conflict for key {0}")]
    KeyVaultConflict(Uuid),

    /// Key vault backend failure
    #[error("key vault error: {0}")]
    KeyVault(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`Error`] values.
///
/// Callers deciding whether to retry, re-prompt for a schema, or surface a
/// hard failure should match on this instead of individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Schema could not be compiled.
    Schema,
    /// A data key or key vault record is missing.
    NotFound,
    /// The master key provider failed (network, permission, timeout).
    Provider,
    /// A ciphertext could not be authenticated or decoded.
    Decryption,
    /// The document does not have the shape the schema expects.
    SchemaMismatch,
    /// Anything else (I/O, configuration, vault conflicts).
    Other,
}

impl Error {
    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema(_) => ErrorKind::Schema,
            Self::KeyNotFound(_) => ErrorKind::NotFound,
            Self::KeyProvider(_) => ErrorKind::Provider,
            Self::DecryptionFailed(_)
            | Self::AuthenticationFailed
            | Self::InvalidHeader(_)
            | Self::UnsupportedVersion { .. } => ErrorKind::Decryption,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::EncryptionFailed(_)
            | Self::InvalidKeyLength { .. }
            | Self::KeyVaultConflict(_)
            | Self::KeyVault(_)
            | Self::Config(_)
            | Self::Io(_) => ErrorKind::Other,
        }
    }

    pub(crate) fn mismatch(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch { path: path.into(), reason: reason.into() }
    }
}

/// Errors specific to master key provider operations.
#[derive(Debug)]
pub enum KeyProviderError {
    /// No provider registered for the requested kind
    NotConfigured(ProviderKind),

    /// The master key coordinates are invalid for this provider
    InvalidMasterKey(String),

    /// DEK wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed
    UnwrapFailed(String),

    /// The provider refused the operation
    AccessDenied(String),

    /// The provider did not answer in time
    Timeout(Duration),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured(kind) => write!(f, "no provider configured for `{kind}`"),
            Self::InvalidMasterKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::AccessDenied(msg) => write!(f, "access denied: {msg}"),
            Self::Timeout(after) => write!(f, "provider call timed out after {after:?}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
