//! Key vault: durable storage of wrapped data keys.
//!
//! Each data key is persisted as a [`KeyVaultDocument`] holding the wrapped
//! key material and the coordinates of the master key that wrapped it. The
//! plaintext key never reaches the vault.

use crate::error::{Error, Result};
use crate::key_provider::MasterKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle status of a data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum KeyStatus {
    /// Usable for encryption and decryption.
    #[default]
    Active,
    /// Retained for decryption of existing values only.
    Disabled,
}

impl From<KeyStatus> for u8 {
    fn from(status: KeyStatus) -> Self {
        match status {
            KeyStatus::Active => 0,
            KeyStatus::Disabled => 1,
        }
    }
}

impl TryFrom<u8> for KeyStatus {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Active),
            1 => Ok(Self::Disabled),
            other => Err(format!("unknown key status {other}")),
        }
    }
}

/// Persisted record of one data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVaultDocument {
    /// Data key identifier.
    #[serde(rename = "_id")]
    pub key_id: Uuid,
    /// Data key material wrapped by the master key.
    #[serde(with = "base64_bytes")]
    pub key_material: Vec<u8>,
    /// Where the wrapping master key lives.
    pub master_key: MasterKey,
    /// When the record was created.
    pub creation_date: DateTime<Utc>,
    /// When the wrapped material last changed.
    pub update_date: DateTime<Utc>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: KeyStatus,
}

impl KeyVaultDocument {
    /// Creates an active record timestamped now.
    #[must_use]
    pub fn new(key_id: Uuid, key_material: Vec<u8>, master_key: MasterKey) -> Self {
        let now = Utc::now();
        Self {
            key_id,
            key_material,
            master_key,
            creation_date: now,
            update_date: now,
            status: KeyStatus::Active,
        }
    }

    /// Returns a copy carrying new wrapped material and master key.
    #[must_use]
    pub fn rewrapped(&self, key_material: Vec<u8>, master_key: MasterKey) -> Self {
        Self { key_material, master_key, update_date: Utc::now(), ..self.clone() }
    }
}

/// Storage backend for key vault documents.
///
/// `replace` is a compare-and-swap on the wrapped material: it fails with
/// `Error::KeyVaultConflict` when the stored material no longer equals
/// `expected_key_material`, so concurrent rotations cannot silently lose a
/// write.
#[async_trait]
pub trait KeyVault: Send + Sync {
    /// Inserts a new record and returns its key id.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyVaultConflict` if a record with the same id exists.
    async fn store(&self, document: KeyVaultDocument) -> Result<Uuid>;

    /// Fetches a record by key id.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no record exists.
    async fn fetch(&self, key_id: Uuid) -> Result<KeyVaultDocument>;

    /// Replaces a record whose current material equals `expected_key_material`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` or `Error::KeyVaultConflict`.
    async fn replace(
        &self,
        document: KeyVaultDocument,
        expected_key_material: &[u8],
    ) -> Result<()>;

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no record exists.
    async fn delete(&self, key_id: Uuid) -> Result<()>;

    /// Lists all records, oldest first.
    async fn list(&self) -> Result<Vec<KeyVaultDocument>>;
}

/// Applies a compare-and-swap replacement to an in-memory record set.
///
/// Shared by vault backends that keep their records in a map.
///
/// # Errors
///
/// Returns `Error::KeyNotFound` or `Error::KeyVaultConflict`.
pub fn replace_in(
    records: &mut HashMap<Uuid, KeyVaultDocument>,
    document: KeyVaultDocument,
    expected_key_material: &[u8],
) -> Result<()> {
    let current = records
        .get_mut(&document.key_id)
        .ok_or(Error::KeyNotFound(document.key_id))?;
    if current.key_material != expected_key_material {
        return Err(Error::KeyVaultConflict(document.key_id));
    }
    *current = document;
    Ok(())
}

/// Returns records oldest first, ties broken by id.
#[must_use]
pub fn sorted(records: &HashMap<Uuid, KeyVaultDocument>) -> Vec<KeyVaultDocument> {
    let mut out: Vec<_> = records.values().cloned().collect();
    out.sort_by(|a, b| a.creation_date.cmp(&b.creation_date).then(a.key_id.cmp(&b.key_id)));
    out
}

/// Process-local key vault. Records are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryKeyVault {
    records: RwLock<HashMap<Uuid, KeyVaultDocument>>,
}

impl InMemoryKeyVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyVault for InMemoryKeyVault {
    async fn store(&self, document: KeyVaultDocument) -> Result<Uuid> {
        let mut records = self.records.write().await;
        let key_id = document.key_id;
        if records.contains_key(&key_id) {
            return Err(Error::KeyVaultConflict(key_id));
        }
        records.insert(key_id, document);
        Ok(key_id)
    }

    async fn fetch(&self, key_id: Uuid) -> Result<KeyVaultDocument> {
        self.records.read().await.get(&key_id).cloned().ok_or(Error::KeyNotFound(key_id))
    }

    async fn replace(
        &self,
        document: KeyVaultDocument,
        expected_key_material: &[u8],
    ) -> Result<()> {
        replace_in(&mut *self.records.write().await, document, expected_key_material)
    }

    async fn delete(&self, key_id: Uuid) -> Result<()> {
        self.records
            .write()
            .await
            .remove(&key_id)
            .map(|_| ())
            .ok_or(Error::KeyNotFound(key_id))
    }

    async fn list(&self) -> Result<Vec<KeyVaultDocument>> {
        Ok(sorted(&*self.records.read().await))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(material: &[u8]) -> KeyVaultDocument {
        KeyVaultDocument::new(Uuid::new_v4(), material.to_vec(), MasterKey::Local)
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let vault = InMemoryKeyVault::new();
        let record = doc(b"wrapped");
        assert_eq!(vault.store(record.clone()).await.unwrap(), record.key_id);

        assert_eq!(vault.fetch(record.key_id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let vault = InMemoryKeyVault::new();
        let id = Uuid::new_v4();
        assert!(matches!(vault.fetch(id).await, Err(Error::KeyNotFound(missing)) if missing == id));
    }

    #[tokio::test]
    async fn test_duplicate_store_conflicts() {
        let vault = InMemoryKeyVault::new();
        let record = doc(b"a");
        vault.store(record.clone()).await.unwrap();
        assert!(matches!(vault.store(record).await, Err(Error::KeyVaultConflict(_))));
    }

    #[tokio::test]
    async fn test_replace_is_compare_and_swap() {
        let vault = InMemoryKeyVault::new();
        let record = doc(b"old");
        vault.store(record.clone()).await.unwrap();

        let updated = record.rewrapped(b"new".to_vec(), MasterKey::Local);
        vault.replace(updated.clone(), b"old").await.unwrap();
        assert_eq!(vault.fetch(record.key_id).await.unwrap().key_material, b"new");

        // A second writer still holding the old material loses.
        let stale = record.rewrapped(b"other".to_vec(), MasterKey::Local);
        assert!(matches!(vault.replace(stale, b"old").await, Err(Error::KeyVaultConflict(_))));
        assert_eq!(vault.fetch(record.key_id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_delete() {
        let vault = InMemoryKeyVault::new();
        let record = doc(b"x");
        vault.store(record.clone()).await.unwrap();

        vault.delete(record.key_id).await.unwrap();
        assert!(vault.list().await.unwrap().is_empty());
        assert!(matches!(vault.delete(record.key_id).await, Err(Error::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_oldest_first() {
        let vault = InMemoryKeyVault::new();
        let mut first = doc(b"1");
        let second = doc(b"2");
        first.creation_date = second.creation_date - chrono::Duration::seconds(10);

        vault.store(second.clone()).await.unwrap();
        vault.store(first.clone()).await.unwrap();

        let ids: Vec<_> = vault.list().await.unwrap().into_iter().map(|d| d.key_id).collect();
        assert_eq!(ids, vec![first.key_id, second.key_id]);
    }

    #[test]
    fn test_document_serde_shape() {
        let record = KeyVaultDocument::new(Uuid::nil(), vec![1, 2, 3], MasterKey::Local);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["_id"], json!("00000000-0000-0000-0000-000000000000"));
        assert_eq!(value["keyMaterial"], json!("AQID"));
        assert_eq!(value["masterKey"], json!({ "provider": "local" }));
        assert_eq!(value["status"], json!(0));
        assert!(value.get("creationDate").is_some());

        let back: KeyVaultDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut value = serde_json::to_value(doc(b"x")).unwrap();
        value["status"] = json!(7);
        assert!(serde_json::from_value::<KeyVaultDocument>(value).is_err());
    }
}
