//! Document transform pipeline.
//!
//! A transform runs in three steps:
//!
//! 1. plan: walk the document, validate its shape against the schema and
//!    collect the key ids it needs;
//! 2. resolve every needed data key through the key manager;
//! 3. rewrite: build a new document with matched values encrypted (or every
//!    ciphertext decrypted).
//!
//! Only step 2 awaits. Any failure aborts the whole document, so callers
//! never see a partially transformed result. The input is never modified.

use crate::cipher;
use crate::error::{Error, Result};
use crate::header::{self, CiphertextEnvelope};
use crate::key_manager::{EnvelopeKeyManager, KeyRing};
use crate::schema::CompiledSchema;
use crate::value::{Document, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle of one document transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformState {
    /// Not started.
    Start,
    /// Planning, resolving keys or rewriting.
    Walking,
    /// Produced a complete document.
    Done,
    /// Aborted; no output was produced.
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypt => f.write_str("encrypt"),
            Self::Decrypt => f.write_str("decrypt"),
        }
    }
}

/// Runs document transforms against one key manager and records the state
/// of the most recent run.
pub struct DocumentTransform<'a> {
    keys: &'a EnvelopeKeyManager,
    state: TransformState,
}

impl<'a> DocumentTransform<'a> {
    /// Creates a transform in the `Start` state.
    #[must_use]
    pub const fn new(keys: &'a EnvelopeKeyManager) -> Self {
        Self { keys, state: TransformState::Start }
    }

    /// State of the most recent run.
    #[must_use]
    pub const fn state(&self) -> TransformState {
        self.state
    }

    /// Encrypts every field of `document` that `schema` marks for encryption.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemaMismatch` if the document does not fit the
    /// schema, and key manager errors if a data key cannot be resolved.
    pub async fn encrypt_for_write(
        &mut self,
        document: &Document,
        schema: &CompiledSchema,
    ) -> Result<Document> {
        let work = plan_and_encrypt(self.keys, document, schema);
        self.run(Direction::Encrypt, work).await
    }

    /// Decrypts every encrypted value anywhere in `document`.
    ///
    /// # Errors
    ///
    /// Fails if any ciphertext is malformed, references an unknown key, or
    /// does not authenticate.
    pub async fn decrypt_for_read(&mut self, document: &Document) -> Result<Document> {
        let work = plan_and_decrypt(self.keys, document);
        self.run(Direction::Decrypt, work).await
    }

    async fn run(
        &mut self,
        direction: Direction,
        work: impl Future<Output = Result<Document>>,
    ) -> Result<Document> {
        self.state = TransformState::Walking;
        let result = work.await;
        self.state = match &result {
            Ok(_) => {
                debug!("{direction} transform done");
                TransformState::Done
            }
            Err(e) => {
                warn!("{direction} transform failed: {e}");
                TransformState::Failed
            }
        };
        result
    }
}

async fn plan_and_encrypt(
    keys: &EnvelopeKeyManager,
    document: &Document,
    schema: &CompiledSchema,
) -> Result<Document> {
    let mut needed = BTreeSet::new();
    plan_encrypt(document, schema, &mut Vec::new(), &mut needed)?;
    if needed.is_empty() {
        return Ok(document.clone());
    }
    let ring = keys.get_data_keys(&needed).await?;
    encrypt_document(document, schema, &ring)
}

async fn plan_and_decrypt(keys: &EnvelopeKeyManager, document: &Document) -> Result<Document> {
    let mut needed = BTreeSet::new();
    plan_decrypt_document(document, &mut Vec::new(), &mut needed)?;
    if needed.is_empty() {
        return Ok(document.clone());
    }
    let ring = keys.get_data_keys(&needed).await?;
    decrypt_document(document, &ring)
}

/// Encrypts the fields of `document` selected by `schema`.
///
/// # Errors
///
/// See [`DocumentTransform::encrypt_for_write`].
pub async fn encrypt_for_write(
    keys: &EnvelopeKeyManager,
    document: &Document,
    schema: &CompiledSchema,
) -> Result<Document> {
    DocumentTransform::new(keys).encrypt_for_write(document, schema).await
}

/// Decrypts every encrypted value in `document`.
///
/// # Errors
///
/// See [`DocumentTransform::decrypt_for_read`].
pub async fn decrypt_for_read(keys: &EnvelopeKeyManager, document: &Document) -> Result<Document> {
    DocumentTransform::new(keys).decrypt_for_read(document).await
}

/// Encrypts `document` with already resolved keys.
///
/// # Errors
///
/// Returns `Error::KeyNotFound` if `keys` lacks a key the schema needs, and
/// the errors of [`cipher::encrypt_value`].
pub fn encrypt_document(
    document: &Document,
    schema: &CompiledSchema,
    keys: &KeyRing,
) -> Result<Document> {
    encrypt_fields(document, schema, &mut Vec::new(), keys)
}

/// Decrypts `document` with already resolved keys.
///
/// # Errors
///
/// Returns `Error::KeyNotFound` if `keys` lacks a referenced key, and the
/// errors of [`cipher::decrypt_value`].
pub fn decrypt_document(document: &Document, keys: &KeyRing) -> Result<Document> {
    decrypt_fields(document, &mut Vec::new(), keys)
}

fn plan_encrypt(
    document: &Document,
    schema: &CompiledSchema,
    path: &mut Vec<String>,
    needed: &mut BTreeSet<Uuid>,
) -> Result<()> {
    for (name, value) in document.iter() {
        path.push(name.to_string());
        if let Some(directive) = schema.directive(path) {
            if value.is_encrypted() {
                return Err(Error::mismatch(path.join("."), "value is already encrypted"));
            }
            if !matches!(value, Value::Null) {
                needed.insert(directive.key_id);
            }
        } else if schema.is_object(path) {
            match value {
                Value::Document(inner) => plan_encrypt(inner, schema, path, needed)?,
                Value::Null => {}
                other => {
                    return Err(Error::mismatch(
                        path.join("."),
                        format!("expected a document, found {}", other.type_name()),
                    ))
                }
            }
        }
        path.pop();
    }
    Ok(())
}

fn encrypt_fields(
    document: &Document,
    schema: &CompiledSchema,
    path: &mut Vec<String>,
    keys: &KeyRing,
) -> Result<Document> {
    let mut out = Document::new();
    for (name, value) in document.iter() {
        path.push(name.to_string());
        let transformed = match (schema.directive(path), value) {
            (Some(_), Value::Null) => Value::Null,
            (Some(directive), value) => {
                let dotted = path.join(".");
                let key = keys.get(directive.key_id)?;
                Value::encrypted(cipher::encrypt_value(key, directive, value, &dotted)?)
            }
            (None, Value::Document(inner)) if schema.is_object(path) => {
                Value::Document(encrypt_fields(inner, schema, path, keys)?)
            }
            (None, value) => value.clone(),
        };
        path.pop();
        out.insert(name, transformed);
    }
    Ok(out)
}

fn plan_decrypt_document(
    document: &Document,
    path: &mut Vec<String>,
    needed: &mut BTreeSet<Uuid>,
) -> Result<()> {
    for (name, value) in document.iter() {
        path.push(name.to_string());
        plan_decrypt(value, path, needed)?;
        path.pop();
    }
    Ok(())
}

fn plan_decrypt(value: &Value, path: &mut Vec<String>, needed: &mut BTreeSet<Uuid>) -> Result<()> {
    match value {
        Value::Document(inner) => plan_decrypt_document(inner, path, needed),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(i.to_string());
                plan_decrypt(item, path, needed)?;
                path.pop();
            }
            Ok(())
        }
        other => {
            if let Some(blob) = other.as_encrypted() {
                let key_id = header::peek_key_id(blob).map_err(|e| {
                    Error::DecryptionFailed(format!("`{}`: {e}", path.join(".")))
                })?;
                needed.insert(key_id);
            }
            Ok(())
        }
    }
}

fn decrypt_fields(document: &Document, path: &mut Vec<String>, keys: &KeyRing) -> Result<Document> {
    let mut out = Document::new();
    for (name, value) in document.iter() {
        path.push(name.to_string());
        let plain = decrypt_value(value, path, keys)?;
        path.pop();
        out.insert(name, plain);
    }
    Ok(out)
}

fn decrypt_value(value: &Value, path: &mut Vec<String>, keys: &KeyRing) -> Result<Value> {
    match value {
        Value::Document(inner) => Ok(Value::Document(decrypt_fields(inner, path, keys)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                path.push(i.to_string());
                out.push(decrypt_value(item, path, keys)?);
                path.pop();
            }
            Ok(Value::Array(out))
        }
        other => match other.as_encrypted() {
            Some(blob) => {
                let envelope = CiphertextEnvelope::from_bytes(blob)?;
                let key = keys.get(envelope.key_id())?;
                cipher::decrypt_value(key, &envelope).map_err(|e| {
                    debug!("decryption of `{}` failed", path.join("."));
                    e
                })
            }
            None => Ok(other.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kdf::DataKey;
    use crate::schema::{self, Algorithm, Directive, ValueType};
    use secrecy::SecretVec;
    use serde_json::json;
    use std::sync::Arc;

    const KEY_ID: &str = "1f0b1c3e-3b6a-4c59-9d8a-1a2b3c4d5e6f";

    fn key_id() -> Uuid {
        Uuid::parse_str(KEY_ID).unwrap()
    }

    fn ring() -> KeyRing {
        let mut ring = KeyRing::new();
        ring.insert(key_id(), Arc::new(DataKey::from_secret(SecretVec::new(vec![5; 96])).unwrap()));
        ring
    }

    fn patient_schema() -> CompiledSchema {
        schema::compile(&json!({
            "bsonType": "object",
            "encryptMetadata": { "keyId": [KEY_ID] },
            "properties": {
                "ssn": { "encrypt": {
                    "bsonType": "int",
                    "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
                } },
                "bloodType": { "encrypt": {
                    "bsonType": "string",
                    "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Random"
                } },
                "insurance": {
                    "bsonType": "object",
                    "properties": {
                        "policyNumber": { "encrypt": {
                            "bsonType": "string",
                            "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
                        } }
                    }
                },
                "medicalRecords": { "encrypt": {
                    "bsonType": "array",
                    "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Random"
                } }
            }
        }))
        .unwrap()
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[test]
    fn test_encrypts_matched_fields_only() {
        let input = doc(json!({
            "name": "Jon Doe",
            "ssn": 241014209,
            "bloodType": "AB+",
            "insurance": { "provider": "MaestCare", "policyNumber": "123142" },
            "medicalRecords": [{ "weight": 180 }]
        }));

        let out = encrypt_document(&input, &patient_schema(), &ring()).unwrap();

        assert_eq!(out.keys().collect::<Vec<_>>(), input.keys().collect::<Vec<_>>());
        assert_eq!(out.get("name"), input.get("name"));
        assert!(out.get("ssn").unwrap().is_encrypted());
        assert!(out.get("bloodType").unwrap().is_encrypted());
        assert!(out.get("medicalRecords").unwrap().is_encrypted());

        let insurance = out.get("insurance").unwrap().as_document().unwrap();
        assert_eq!(insurance.get("provider"), Some(&Value::from("MaestCare")));
        assert!(insurance.get("policyNumber").unwrap().is_encrypted());

        assert_eq!(decrypt_document(&out, &ring()).unwrap(), input);
    }

    #[test]
    fn test_null_at_matched_leaf_passes_through() {
        let input = doc(json!({ "ssn": null, "insurance": null }));
        let out = encrypt_document(&input, &patient_schema(), &ring()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_non_document_at_object_path_is_mismatch() {
        let input = doc(json!({ "insurance": "none" }));
        let mut needed = BTreeSet::new();
        let err = plan_encrypt(&input, &patient_schema(), &mut Vec::new(), &mut needed)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert!(err.to_string().contains("insurance"));
    }

    #[test]
    fn test_already_encrypted_is_mismatch() {
        let input = doc(json!({ "ssn": 1 }));
        let once = encrypt_document(&input, &patient_schema(), &ring()).unwrap();

        let mut needed = BTreeSet::new();
        let err =
            plan_encrypt(&once, &patient_schema(), &mut Vec::new(), &mut needed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_plan_collects_keys_of_present_fields() {
        let mut needed = BTreeSet::new();
        plan_encrypt(&doc(json!({ "name": "x" })), &patient_schema(), &mut Vec::new(), &mut needed)
            .unwrap();
        assert!(needed.is_empty());

        plan_encrypt(&doc(json!({ "ssn": 3 })), &patient_schema(), &mut Vec::new(), &mut needed)
            .unwrap();
        assert_eq!(needed.into_iter().collect::<Vec<_>>(), vec![key_id()]);
    }

    #[test]
    fn test_decrypts_ciphertext_without_schema() {
        let directive = Directive {
            key_id: key_id(),
            algorithm: Algorithm::Random,
            value_type: Some(ValueType::String),
        };
        let ring = ring();
        let blob = cipher::encrypt_value(ring.get(key_id()).unwrap(), &directive, &"x".into(), "a")
            .unwrap();

        let mut nested = Document::new();
        nested.insert("deep", Value::Array(vec![Value::Int32(1), Value::encrypted(blob.clone())]));
        let mut input = Document::new();
        input.insert("top", Value::encrypted(blob));
        input.insert("nested", nested);

        let out = decrypt_document(&input, &ring).unwrap();
        assert_eq!(out.get("top"), Some(&Value::from("x")));
        let deep = out.get("nested").unwrap().as_document().unwrap().get("deep").unwrap();
        assert_eq!(deep, &Value::Array(vec![Value::Int32(1), Value::from("x")]));
    }

    #[test]
    fn test_undecryptable_value_fails_whole_document() {
        let input = doc(json!({ "ssn": 7, "bloodType": "O-" }));
        let mut out = encrypt_document(&input, &patient_schema(), &ring()).unwrap();

        let Some(Value::Binary(mut blob)) = out.remove("bloodType") else {
            panic!("bloodType not encrypted");
        };
        let last = blob.bytes.len() - 1;
        blob.bytes[last] ^= 1;
        out.insert("bloodType", Value::Binary(blob));

        let err = decrypt_document(&out, &ring()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decryption);
    }

    #[test]
    fn test_garbage_ciphertext_fails_plan() {
        let mut input = Document::new();
        input.insert("x", Value::encrypted(vec![9, 9, 9]));

        let err = plan_decrypt_document(&input, &mut Vec::new(), &mut BTreeSet::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decryption);
    }

    #[test]
    fn test_missing_key_in_ring() {
        let input = doc(json!({ "ssn": 1 }));
        let err = encrypt_document(&input, &patient_schema(), &KeyRing::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_transform_states() {
        use crate::key_provider::{LocalKeyProvider, MasterKey};
        use crate::key_vault::InMemoryKeyVault;

        let provider = LocalKeyProvider::new(&SecretVec::new(vec![1; 96])).unwrap();
        let manager = EnvelopeKeyManager::new(Arc::new(InMemoryKeyVault::new()))
            .with_provider(Arc::new(provider));
        let key_id = manager.create_data_key(MasterKey::Local).await.unwrap();
        let schema = schema::compile(&json!({
            "bsonType": "object",
            "properties": {
                "ssn": { "encrypt": {
                    "bsonType": "int", "algorithm": "Deterministic", "keyId": key_id.to_string()
                } }
            }
        }))
        .unwrap();

        let mut transform = DocumentTransform::new(&manager);
        assert_eq!(transform.state(), TransformState::Start);

        let input = doc(json!({ "ssn": 1 }));
        let encrypted = transform.encrypt_for_write(&input, &schema).await.unwrap();
        assert_eq!(transform.state(), TransformState::Done);

        let err = transform.encrypt_for_write(&doc(json!({ "ssn": "x" })), &schema).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert_eq!(transform.state(), TransformState::Failed);

        assert_eq!(transform.decrypt_for_read(&encrypted).await.unwrap(), input);
        assert_eq!(transform.state(), TransformState::Done);
    }
}
