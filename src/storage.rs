/// Storage
///
/// Async key/value contract every stateful component persists through, with
/// an in-memory backend and a JSON file backend.
///
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Every method fails with `Error::NotInitialized` until `init` has run.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn get_keys(&self) -> Result<Vec<String>>;
    async fn get_entries(&self) -> Result<Vec<(String, Value)>>;
    async fn get_item(&self, key: &str) -> Result<Option<Value>>;
    async fn set_item(&self, key: &str, value: Value) -> Result<()>;
    async fn remove_item(&self, key: &str) -> Result<()>;
    async fn has_item(&self, key: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
}

pub async fn get_typed<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> Result<Option<T>> {
    storage
        .get_item(key)
        .await?
        .map(serde_json::from_value)
        .transpose()
        .map_err(Error::from)
}

pub async fn set_typed<T: Serialize>(
    storage: &dyn KeyValueStorage,
    key: &str,
    value: &T,
) -> Result<()> {
    let value = serde_json::to_value(value)?;
    storage.set_item(key, value).await
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    initialized: AtomicBool,
    items: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_init(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized("storage"))
        }
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn init(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_keys(&self) -> Result<Vec<String>> {
        self.ensure_init()?;
        Ok(self.items.read().await.keys().cloned().collect())
    }

    async fn get_entries(&self) -> Result<Vec<(String, Value)>> {
        self.ensure_init()?;
        Ok(self
            .items
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_init()?;
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        self.ensure_init()?;
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.ensure_init()?;
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn has_item(&self, key: &str) -> Result<bool> {
        self.ensure_init()?;
        Ok(self.items.read().await.contains_key(key))
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_init()?;
        self.items.write().await.clear();
        Ok(())
    }
}

/// Keeps every entry in one JSON object on disk, rewritten on each mutation.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: RwLock<Option<HashMap<String, Value>>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            items: RwLock::new(None),
        }
    }

    async fn flush(&self, items: &HashMap<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(items)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn init(&self) -> Result<()> {
        let mut items = self.items.write().await;
        if items.is_some() {
            return Ok(());
        }
        let loaded = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("reading {}", self.path.display()))
                    .into());
            }
        };
        *items = Some(loaded);
        Ok(())
    }

    async fn get_keys(&self) -> Result<Vec<String>> {
        let items = self.items.read().await;
        let items = items.as_ref().ok_or(Error::NotInitialized("storage"))?;
        Ok(items.keys().cloned().collect())
    }

    async fn get_entries(&self) -> Result<Vec<(String, Value)>> {
        let items = self.items.read().await;
        let items = items.as_ref().ok_or(Error::NotInitialized("storage"))?;
        Ok(items.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let items = self.items.read().await;
        let items = items.as_ref().ok_or(Error::NotInitialized("storage"))?;
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        let mut items = self.items.write().await;
        let items = items.as_mut().ok_or(Error::NotInitialized("storage"))?;
        items.insert(key.to_string(), value);
        self.flush(items).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.write().await;
        let items = items.as_mut().ok_or(Error::NotInitialized("storage"))?;
        if items.remove(key).is_some() {
            self.flush(items).await?;
        }
        Ok(())
    }

    async fn has_item(&self, key: &str) -> Result<bool> {
        let items = self.items.read().await;
        let items = items.as_ref().ok_or(Error::NotInitialized("storage"))?;
        Ok(items.contains_key(key))
    }

    async fn clear(&self) -> Result<()> {
        let mut items = self.items.write().await;
        let items = items.as_mut().ok_or(Error::NotInitialized("storage"))?;
        items.clear();
        self.flush(items).await
    }
}
