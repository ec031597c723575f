//! JSON file key vault for `fieldseal`.
//!
//! Stores key vault documents in a single JSON array on disk. Every
//! mutation rewrites the whole file through a temporary file in the same
//! directory that is then renamed over the original, so a crash leaves
//! either the old or the new contents and never a torn file.
//!
//! A mutation runs to completion on its own task even if the caller stops
//! waiting for it (for example on a timeout), so the in-memory records never
//! fall behind the file.
//!
//! Suitable for development, tests and single-process deployments.

#![warn(clippy::pedantic, clippy::nursery)]

use async_trait::async_trait;
use fieldseal::error::{Error, Result};
use fieldseal::key_vault::{self, KeyVault, KeyVaultDocument};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Key vault persisted as a JSON file.
///
/// ```text
/// [
///   { "_id": "…", "keyMaterial": "<base64>", "masterKey": { "provider": "local" },
///     "creationDate": "…", "updateDate": "…", "status": 0 }
/// ]
/// ```
pub struct JsonFileKeyVault {
    path: PathBuf,
    records: Arc<Mutex<Records>>,
}

type Records = HashMap<Uuid, KeyVaultDocument>;

impl JsonFileKeyVault {
    /// Opens the vault at `path`. A missing file is an empty vault; it is
    /// created on the first write.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read and `Error::KeyVault`
    /// if it is not a valid vault.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => parse(&path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("opened key vault {} with {} keys", path.display(), records.len());
        Ok(Self { path, records: Arc::new(Mutex::new(records)) })
    }

    /// Location of the vault file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `change` to a copy of the records, writes the copy and only
    /// then makes it current.
    ///
    /// The work runs on a spawned task holding the records lock, so dropping
    /// the returned future cannot separate the file write from the swap.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Records) -> Result<T> + Send + 'static,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let records = Arc::clone(&self.records);
        tokio::spawn(apply(records, self.path.clone(), change))
            .await
            .map_err(|e| Error::KeyVault(format!("mutation task failed: {e}")))?
    }
}

#[async_trait]
impl KeyVault for JsonFileKeyVault {
    async fn store(&self, document: KeyVaultDocument) -> Result<Uuid> {
        self.mutate(move |records| {
            let key_id = document.key_id;
            if records.contains_key(&key_id) {
                return Err(Error::KeyVaultConflict(key_id));
            }
            records.insert(key_id, document);
            Ok(key_id)
        })
        .await
    }

    async fn fetch(&self, key_id: Uuid) -> Result<KeyVaultDocument> {
        self.records.lock().await.get(&key_id).cloned().ok_or(Error::KeyNotFound(key_id))
    }

    async fn replace(
        &self,
        document: KeyVaultDocument,
        expected_key_material: &[u8],
    ) -> Result<()> {
        let expected = expected_key_material.to_vec();
        self.mutate(move |records| key_vault::replace_in(records, document, &expected)).await
    }

    async fn delete(&self, key_id: Uuid) -> Result<()> {
        self.mutate(move |records| {
            records.remove(&key_id).map(|_| ()).ok_or(Error::KeyNotFound(key_id))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<KeyVaultDocument>> {
        Ok(key_vault::sorted(&*self.records.lock().await))
    }
}

async fn apply<T>(
    records: Arc<Mutex<Records>>,
    path: PathBuf,
    change: impl FnOnce(&mut Records) -> Result<T>,
) -> Result<T> {
    let mut records = records.lock_owned().await;
    let mut next = records.clone();
    let out = change(&mut next)?;

    let bytes = serde_json::to_vec_pretty(&key_vault::sorted(&next))
        .map_err(|e| Error::KeyVault(format!("serialize: {e}")))?;
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(|e| Error::KeyVault(format!("write task failed: {e}")))??;

    *records = next;
    Ok(out)
}

fn parse(path: &Path, bytes: &[u8]) -> Result<HashMap<Uuid, KeyVaultDocument>> {
    let documents: Vec<KeyVaultDocument> = serde_json::from_slice(bytes)
        .map_err(|e| Error::KeyVault(format!("{}: {e}", path.display())))?;

    let mut records = HashMap::with_capacity(documents.len());
    for document in documents {
        let key_id = document.key_id;
        if records.insert(key_id, document).is_some() {
            return Err(Error::KeyVault(format!(
                "{}: duplicate key id {key_id}",
                path.display()
            )));
        }
    }
    Ok(records)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldseal::key_provider::MasterKey;

    fn doc(material: &[u8]) -> KeyVaultDocument {
        KeyVaultDocument::new(Uuid::new_v4(), material.to_vec(), MasterKey::Local)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_vault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let vault = JsonFileKeyVault::open(&path).unwrap();
        assert!(vault.list().await.unwrap().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let record = doc(b"wrapped");

        {
            let vault = JsonFileKeyVault::open(&path).unwrap();
            vault.store(record.clone()).await.unwrap();
        }

        let reopened = JsonFileKeyVault::open(&path).unwrap();
        assert_eq!(reopened.fetch(record.key_id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_replace_and_delete_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let vault = JsonFileKeyVault::open(&path).unwrap();

        let keep = doc(b"keep");
        let dropped = doc(b"drop");
        vault.store(keep.clone()).await.unwrap();
        vault.store(dropped.clone()).await.unwrap();

        let rotated = keep.rewrapped(b"rotated".to_vec(), MasterKey::Local);
        vault.replace(rotated, b"keep").await.unwrap();
        vault.delete(dropped.key_id).await.unwrap();

        let reopened = JsonFileKeyVault::open(&path).unwrap();
        let all = reopened.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key_material, b"rotated");
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let vault = JsonFileKeyVault::open(&path).unwrap();
        let record = doc(b"v1");
        vault.store(record.clone()).await.unwrap();

        let stale = record.rewrapped(b"v2".to_vec(), MasterKey::Local);
        let err = vault.replace(stale, b"not-v1").await.unwrap_err();
        assert!(matches!(err, Error::KeyVaultConflict(_)));

        let on_disk = JsonFileKeyVault::open(&path).unwrap();
        assert_eq!(on_disk.fetch(record.key_id).await.unwrap().key_material, b"v1");
    }

    async fn wait_for_file(path: &Path) {
        for _ in 0..200 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("{} was never written", path.display());
    }

    #[tokio::test]
    async fn test_abandoned_store_still_becomes_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let vault = JsonFileKeyVault::open(&path).unwrap();
        let record = doc(b"wrapped");

        // Stop waiting after the first poll, as a timeout would.
        tokio::select! {
            biased;
            result = vault.store(record.clone()) => { result.unwrap(); }
            () = std::future::ready(()) => {}
        }

        wait_for_file(&path).await;
        assert_eq!(vault.fetch(record.key_id).await.unwrap(), record);
        let on_disk = JsonFileKeyVault::open(&path).unwrap();
        assert_eq!(on_disk.list().await.unwrap(), vault.list().await.unwrap());
    }

    #[tokio::test]
    async fn test_manager_timeout_leaves_file_and_memory_in_step() {
        use fieldseal::config::LocalProviderConfig;
        use fieldseal::key_manager::EnvelopeKeyManager;
        use fieldseal::key_provider::LocalKeyProvider;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let vault = Arc::new(JsonFileKeyVault::open(&path).unwrap());
        let local = LocalKeyProvider::from_config(&LocalProviderConfig::from_bytes(&[7; 96]))
            .unwrap();
        let manager = EnvelopeKeyManager::new(Arc::clone(&vault) as Arc<dyn KeyVault>)
            .with_provider(Arc::new(local))
            .with_timeout(std::time::Duration::ZERO);

        // Whether or not the store beats the deadline, the record it wrote
        // must be visible through the open vault.
        let _ = manager.create_data_key(MasterKey::Local).await;

        wait_for_file(&path).await;
        let in_memory = vault.list().await.unwrap();
        let on_disk = JsonFileKeyVault::open(&path).unwrap().list().await.unwrap();
        assert_eq!(in_memory.len(), 1);
        assert_eq!(in_memory, on_disk);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(JsonFileKeyVault::open(&path), Err(Error::KeyVault(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let record = doc(b"x");
        std::fs::write(&path, serde_json::to_vec(&vec![record.clone(), record]).unwrap()).unwrap();

        assert!(matches!(JsonFileKeyVault::open(&path), Err(Error::KeyVault(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let vault = JsonFileKeyVault::open(&path).unwrap();
        vault.store(doc(b"x")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
