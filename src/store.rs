/// Store
///
/// Generic persisted map used for pairings, sessions, proposals and pending
/// requests. Every mutation holds the store lock until the write reaches
/// storage, so two mutations of one store never interleave.
///
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::{KeyValueStorage, get_typed, set_typed};

pub trait StoreEntry:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn key(&self) -> String;
}

pub struct Store<V> {
    name: &'static str,
    storage_key: &'static str,
    storage: Arc<dyn KeyValueStorage>,
    entries: Mutex<Option<HashMap<String, V>>>,
}

impl<V: StoreEntry> Store<V> {
    pub fn new(
        name: &'static str,
        storage_key: &'static str,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Self {
        Self {
            name,
            storage_key,
            storage,
            entries: Mutex::new(None),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.is_some() {
            return Ok(());
        }
        let persisted: Vec<V> = get_typed(self.storage.as_ref(), self.storage_key)
            .await?
            .unwrap_or_default();
        debug!("{}: restored {} entries", self.name, persisted.len());
        *entries = Some(persisted.into_iter().map(|v| (v.key(), v)).collect());
        Ok(())
    }

    async fn persist(&self, entries: &HashMap<String, V>) -> Result<()> {
        let values: Vec<&V> = entries.values().collect();
        set_typed(self.storage.as_ref(), self.storage_key, &values).await
    }

    /// Upsert
    pub async fn set(&self, value: V) -> Result<()> {
        let mut guard = self.entries.lock().await;
        let entries = guard.as_mut().ok_or(Error::NotInitialized(self.name))?;
        entries.insert(value.key(), value);
        self.persist(entries).await
    }

    pub async fn get(&self, key: &str) -> Result<V> {
        self.try_get(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {key}", self.name)))
    }

    pub async fn try_get(&self, key: &str) -> Result<Option<V>> {
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or(Error::NotInitialized(self.name))?;
        Ok(entries.get(key).cloned())
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.try_get(key).await?.is_some())
    }

    pub async fn update<F>(&self, key: &str, f: F) -> Result<V>
    where
        F: FnOnce(&mut V) + Send,
    {
        let mut guard = self.entries.lock().await;
        let entries = guard.as_mut().ok_or(Error::NotInitialized(self.name))?;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("{} {key}", self.name)))?;
        f(entry);
        let updated = entry.clone();
        self.persist(entries).await?;
        Ok(updated)
    }

    /// Removes and returns the entry; absent keys are not an error.
    pub async fn delete(&self, key: &str) -> Result<Option<V>> {
        let mut guard = self.entries.lock().await;
        let entries = guard.as_mut().ok_or(Error::NotInitialized(self.name))?;
        let removed = entries.remove(key);
        if removed.is_some() {
            self.persist(entries).await?;
        }
        Ok(removed)
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or(Error::NotInitialized(self.name))?;
        Ok(entries.keys().cloned().collect())
    }

    pub async fn values(&self) -> Result<Vec<V>> {
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or(Error::NotInitialized(self.name))?;
        Ok(entries.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::storage::MemoryStorage;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        topic: String,
        hits: u32,
    }

    impl StoreEntry for Entry {
        fn key(&self) -> String {
            self.topic.clone()
        }
    }

    async fn storage() -> Arc<dyn KeyValueStorage> {
        let storage = MemoryStorage::new();
        storage.init().await.unwrap();
        Arc::new(storage)
    }

    #[tokio::test]
    async fn test_store_lifecycle() {
        let storage = storage().await;
        let store: Store<Entry> = Store::new("entry", "test:entry", storage.clone());
        assert!(matches!(store.keys().await, Err(Error::NotInitialized(_))));
        store.init().await.unwrap();

        store
            .set(Entry { topic: "a".into(), hits: 0 })
            .await
            .unwrap();
        let updated = store.update("a", |e| e.hits += 1).await.unwrap();
        assert_eq!(updated.hits, 1);
        assert!(matches!(
            store.update("b", |e| e.hits += 1).await,
            Err(Error::NotFound(_))
        ));

        // a fresh store over the same storage sees the persisted entry
        let reloaded: Store<Entry> = Store::new("entry", "test:entry", storage);
        reloaded.init().await.unwrap();
        assert_eq!(reloaded.get("a").await.unwrap().hits, 1);

        assert!(reloaded.delete("a").await.unwrap().is_some());
        assert!(reloaded.delete("a").await.unwrap().is_none());
        assert!(reloaded.values().await.unwrap().is_empty());
    }
}
