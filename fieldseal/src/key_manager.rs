//! Envelope key manager.
//!
//! Creates, caches, rotates and deletes data keys. Each data key is wrapped
//! by a master key provider and persisted in a [`KeyVault`]; unwrapped keys
//! are cached in memory until explicitly evicted.
//!
//! Cache misses for the same key id are serialized on a per-key lock so
//! concurrent transforms trigger one provider call, not one per caller.

use crate::config::{EncryptionOptions, DEFAULT_PROVIDER_TIMEOUT};
use crate::error::{Error, KeyProviderError, Result};
use crate::kdf::DataKey;
use crate::key_provider::{LocalKeyProvider, MasterKey, MasterKeyProvider, ProviderKind};
use crate::key_vault::{KeyVault, KeyVaultDocument};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unwrapped data keys resolved for one document transform.
#[derive(Debug, Default, Clone)]
pub struct KeyRing {
    keys: HashMap<Uuid, Arc<DataKey>>,
}

impl KeyRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key.
    pub fn insert(&mut self, key_id: Uuid, key: Arc<DataKey>) {
        self.keys.insert(key_id, key);
    }

    /// Looks up a key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the key was not resolved.
    pub fn get(&self, key_id: Uuid) -> Result<&DataKey> {
        self.keys.get(&key_id).map(|key| &**key).ok_or(Error::KeyNotFound(key_id))
    }

    /// Number of keys in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Creates, resolves and rotates data keys.
pub struct EnvelopeKeyManager {
    vault: Arc<dyn KeyVault>,
    providers: HashMap<ProviderKind, Arc<dyn MasterKeyProvider>>,
    cache: RwLock<HashMap<Uuid, Arc<DataKey>>>,
    population: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    generation: AtomicU64,
    timeout: Duration,
}

impl EnvelopeKeyManager {
    /// Creates a manager with no providers and the default timeout.
    #[must_use]
    pub fn new(vault: Arc<dyn KeyVault>) -> Self {
        Self {
            vault,
            providers: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
            population: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    /// Builds a manager from client options.
    ///
    /// Registers the local provider when one is configured. Remote providers
    /// live in their own crates and are added with [`Self::with_provider`].
    ///
    /// # Errors
    ///
    /// Returns an error if the local master key is invalid.
    pub fn from_options(options: &EncryptionOptions, vault: Arc<dyn KeyVault>) -> Result<Self> {
        let mut manager = Self::new(vault).with_timeout(options.provider_timeout());
        if let Some(local) = options.local() {
            manager = manager.with_provider(Arc::new(LocalKeyProvider::from_config(local)?));
        }
        Ok(manager)
    }

    /// Registers a provider, replacing any previous one of the same kind.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn MasterKeyProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Sets the bound on each provider and vault call.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generates a data key, wraps it under `master_key` and stores it.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyProvider` if no provider serves `master_key` or the
    /// wrap call fails, and vault errors from the store.
    pub async fn create_data_key(&self, master_key: MasterKey) -> Result<Uuid> {
        let provider = self.provider(master_key.provider())?;
        let key = DataKey::generate();

        let wrapped =
            self.bounded(provider.wrap_dek(&master_key, key.expose())).await.map_err(|e| {
                warn!("data key wrap via {} failed: {e}", master_key.provider());
                e
            })?;

        let key_id = Uuid::new_v4();
        let document = KeyVaultDocument::new(key_id, wrapped, master_key);
        let kind = document.master_key.provider();
        self.bounded(self.vault.store(document)).await?;
        self.cache.write().await.insert(key_id, Arc::new(key));

        info!("created data key {key_id} under {kind} master key");
        Ok(key_id)
    }

    /// Resolves an unwrapped data key, from cache or via the provider.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the vault has no record and
    /// `Error::KeyProvider` if unwrapping fails or times out.
    pub async fn get_data_key(&self, key_id: Uuid) -> Result<Arc<DataKey>> {
        if let Some(key) = self.cached(key_id).await {
            return Ok(key);
        }
        self.with_population_lock(key_id, self.load(key_id)).await
    }

    /// Resolves every key in `key_ids` into a [`KeyRing`].
    ///
    /// # Errors
    ///
    /// Fails on the first key that cannot be resolved.
    pub async fn get_data_keys(&self, key_ids: &BTreeSet<Uuid>) -> Result<KeyRing> {
        let mut ring = KeyRing::new();
        for &key_id in key_ids {
            ring.insert(key_id, self.get_data_key(key_id).await?);
        }
        Ok(ring)
    }

    /// Drops a cached key. Returns whether an entry was removed.
    ///
    /// Waits for an in-flight load of the same key to finish first.
    pub async fn evict(&self, key_id: Uuid) -> bool {
        self.with_population_lock(key_id, async {
            let removed = self.cache.write().await.remove(&key_id).is_some();
            if removed {
                debug!("evicted data key {key_id}");
            }
            removed
        })
        .await
    }

    /// Drops every cached key.
    ///
    /// Loads that started before the clear still return their key to their
    /// caller but do not repopulate the cache.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        debug!("clearing {} cached data keys", cache.len());
        cache.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether a key is currently cached.
    pub async fn is_cached(&self, key_id: Uuid) -> bool {
        self.cache.read().await.contains_key(&key_id)
    }

    /// Re-wraps a data key under a new master key.
    ///
    /// The key id and key material are unchanged, so existing ciphertexts
    /// stay decryptable and cache entries stay valid. The vault update is a
    /// compare-and-swap against the material that was unwrapped.
    ///
    /// # Errors
    ///
    /// Returns provider errors from either side of the rewrap and
    /// `Error::KeyVaultConflict` if the record changed concurrently.
    pub async fn rewrap_data_key(&self, key_id: Uuid, new_master_key: MasterKey) -> Result<()> {
        self.with_population_lock(key_id, self.rewrap(key_id, new_master_key)).await
    }

    /// Deletes a data key from the vault and the cache.
    ///
    /// Values encrypted under the key become permanently undecryptable.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the vault has no record.
    pub async fn delete_data_key(&self, key_id: Uuid) -> Result<()> {
        self.with_population_lock(key_id, self.delete(key_id)).await
    }

    async fn cached(&self, key_id: Uuid) -> Option<Arc<DataKey>> {
        self.cache.read().await.get(&key_id).cloned()
    }

    /// Runs `work` while holding the population lock of `key_id`.
    async fn with_population_lock<T>(&self, key_id: Uuid, work: impl Future<Output = T>) -> T {
        let lock = {
            let mut locks = self.population.lock().await;
            Arc::clone(locks.entry(key_id).or_default())
        };
        let guard = lock.lock().await;
        let out = work.await;

        {
            let mut locks = self.population.lock().await;
            // Only the map and this task hold the lock: nobody is waiting.
            if Arc::strong_count(&lock) == 2 {
                locks.remove(&key_id);
            }
        }
        drop(guard);
        out
    }

    async fn load(&self, key_id: Uuid) -> Result<Arc<DataKey>> {
        // Another caller may have populated the entry while we waited.
        if let Some(key) = self.cached(key_id).await {
            return Ok(key);
        }

        debug!("data key cache miss for {key_id}");
        let generation = self.generation.load(Ordering::SeqCst);
        let document = self.bounded(self.vault.fetch(key_id)).await?;
        let key = Arc::new(self.unwrap_document(&document).await?);

        let mut cache = self.cache.write().await;
        if self.generation.load(Ordering::SeqCst) == generation {
            cache.insert(key_id, Arc::clone(&key));
        } else {
            debug!("cache cleared while loading {key_id}; not caching");
        }
        Ok(key)
    }

    async fn delete(&self, key_id: Uuid) -> Result<()> {
        self.bounded(self.vault.delete(key_id)).await?;
        self.cache.write().await.remove(&key_id);
        info!("deleted data key {key_id}");
        Ok(())
    }

    async fn rewrap(&self, key_id: Uuid, new_master_key: MasterKey) -> Result<()> {
        let document = self.bounded(self.vault.fetch(key_id)).await?;
        let key = self.unwrap_document(&document).await?;

        let provider = self.provider(new_master_key.provider())?;
        let wrapped = self.bounded(provider.wrap_dek(&new_master_key, key.expose())).await?;
        let from = document.master_key.provider();
        let to = new_master_key.provider();

        let updated = document.rewrapped(wrapped, new_master_key);
        self.bounded(self.vault.replace(updated, &document.key_material)).await?;

        info!("rewrapped data key {key_id} from {from} to {to} master key");
        Ok(())
    }

    async fn unwrap_document(&self, document: &KeyVaultDocument) -> Result<DataKey> {
        let kind = document.master_key.provider();
        let provider = self.provider(kind)?;
        let material = self
            .bounded(provider.unwrap_dek(&document.master_key, &document.key_material))
            .await
            .map_err(|e| {
                warn!("unwrap of data key {} via {kind} failed: {e}", document.key_id);
                e
            })?;

        DataKey::from_secret(material).map_err(|e| {
            KeyProviderError::UnwrapFailed(format!("key {}: {e}", document.key_id)).into()
        })
    }

    fn provider(&self, kind: ProviderKind) -> Result<&Arc<dyn MasterKeyProvider>> {
        self.providers.get(&kind).ok_or_else(|| KeyProviderError::NotConfigured(kind).into())
    }

    async fn bounded<T, E>(
        &self,
        call: impl Future<Output = std::result::Result<T, E>> + Send,
    ) -> Result<T>
    where
        Error: From<E>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| KeyProviderError::Timeout(self.timeout))?
            .map_err(Error::from)
    }
}
