/// Expirer
///
/// Tracks one expiry timestamp per target (a topic or a request id) and
/// announces each target exactly once when it lapses. It knows nothing about
/// what the targets are; the receiver handed out by `new` gets every lapsed
/// `Expiration`, and owners clean up after themselves.
///
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::constants::{EXPIRER_STORAGE_KEY, EXPIRER_TARGET_ID, EXPIRER_TARGET_TOPIC};
use crate::error::{Error, Result};
use crate::storage::{KeyValueStorage, get_typed, set_typed};
use crate::utils::unix_timestamp;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExpirerTarget {
    Topic(String),
    Id(u64),
}

impl Display for ExpirerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpirerTarget::Topic(topic) => write!(f, "{EXPIRER_TARGET_TOPIC}:{topic}"),
            ExpirerTarget::Id(id) => write!(f, "{EXPIRER_TARGET_ID}:{id}"),
        }
    }
}

impl FromStr for ExpirerTarget {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((EXPIRER_TARGET_TOPIC, topic)) if !topic.is_empty() => {
                Ok(ExpirerTarget::Topic(topic.to_string()))
            }
            Some((EXPIRER_TARGET_ID, id)) => Ok(ExpirerTarget::Id(id.parse()?)),
            _ => Err(Error::Format(format!("invalid expirer target {s}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    pub target: String,
    pub expiry: u64,
}

impl Expiration {
    pub fn target(&self) -> Result<ExpirerTarget> {
        self.target.parse()
    }
}

pub struct Expirer {
    storage: Arc<dyn KeyValueStorage>,
    entries: Mutex<Option<HashMap<String, u64>>>,
    expired: mpsc::UnboundedSender<Expiration>,
}

impl Expirer {
    /// The receiver yields each lapsed entry once. It is unbounded: an entry
    /// is gone from the map by the time it is sent, so it must not be lost.
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
    ) -> (Self, mpsc::UnboundedReceiver<Expiration>) {
        let (expired, rx) = mpsc::unbounded_channel();
        (
            Self {
                storage,
                entries: Mutex::new(None),
                expired,
            },
            rx,
        )
    }

    pub async fn init(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.is_none() {
            let restored: Vec<Expiration> =
                get_typed(self.storage.as_ref(), EXPIRER_STORAGE_KEY)
                    .await?
                    .unwrap_or_default();
            *entries = Some(restored.into_iter().map(|e| (e.target, e.expiry)).collect());
        }
        Ok(())
    }

    async fn persist(&self, entries: &HashMap<String, u64>) -> Result<()> {
        let values: Vec<Expiration> = entries
            .iter()
            .map(|(target, expiry)| Expiration {
                target: target.clone(),
                expiry: *expiry,
            })
            .collect();
        set_typed(self.storage.as_ref(), EXPIRER_STORAGE_KEY, &values).await
    }

    /// Upsert
    pub async fn set(&self, target: &ExpirerTarget, expiry: u64) -> Result<()> {
        let mut guard = self.entries.lock().await;
        let entries = guard.as_mut().ok_or(Error::NotInitialized("expirer"))?;
        entries.insert(target.to_string(), expiry);
        self.persist(entries).await
    }

    pub async fn get(&self, target: &ExpirerTarget) -> Result<Expiration> {
        let key = target.to_string();
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or(Error::NotInitialized("expirer"))?;
        entries
            .get(&key)
            .map(|expiry| Expiration {
                target: key.clone(),
                expiry: *expiry,
            })
            .ok_or_else(|| Error::NotFound(format!("expiration {key}")))
    }

    pub async fn has(&self, target: &ExpirerTarget) -> Result<bool> {
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or(Error::NotInitialized("expirer"))?;
        Ok(entries.contains_key(&target.to_string()))
    }

    /// Silently ignores targets that are not tracked.
    pub async fn del(&self, target: &ExpirerTarget) -> Result<()> {
        let mut guard = self.entries.lock().await;
        let entries = guard.as_mut().ok_or(Error::NotInitialized("expirer"))?;
        if entries.remove(&target.to_string()).is_some() {
            self.persist(entries).await?;
        }
        Ok(())
    }

    pub async fn values(&self) -> Result<Vec<Expiration>> {
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or(Error::NotInitialized("expirer"))?;
        Ok(entries
            .iter()
            .map(|(target, expiry)| Expiration {
                target: target.clone(),
                expiry: *expiry,
            })
            .collect())
    }

    /// One sweep. Lapsed entries leave the map before they are sent, so no
    /// entry is ever reported twice.
    pub async fn check_expirations(&self, now: u64) -> Result<Vec<Expiration>> {
        let expired: Vec<Expiration> = {
            let mut guard = self.entries.lock().await;
            let entries = guard.as_mut().ok_or(Error::NotInitialized("expirer"))?;
            let expired: Vec<Expiration> = entries
                .iter()
                .filter(|(_, expiry)| **expiry <= now)
                .map(|(target, expiry)| Expiration {
                    target: target.clone(),
                    expiry: *expiry,
                })
                .collect();
            if expired.is_empty() {
                return Ok(expired);
            }
            for expiration in &expired {
                entries.remove(&expiration.target);
            }
            self.persist(entries).await?;
            expired
        };

        for expiration in &expired {
            debug!("expired: {}", expiration.target);
            if self.expired.send(expiration.clone()).is_err() {
                debug!("nobody listens for {}", expiration.target);
            }
        }
        Ok(expired)
    }

    /// Sweeps on every tick until the returned task is aborted.
    pub fn start(self: Arc<Self>, tick: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if let Err(e) = self.check_expirations(unix_timestamp()).await {
                    warn!("expirer sweep failed: {e}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::storage::MemoryStorage;

    async fn expirer() -> (Expirer, mpsc::UnboundedReceiver<Expiration>) {
        let storage = MemoryStorage::new();
        storage.init().await.unwrap();
        let (expirer, expired) = Expirer::new(Arc::new(storage));
        expirer.init().await.unwrap();
        (expirer, expired)
    }

    #[test]
    fn test_target_format() {
        let topic = ExpirerTarget::Topic("abc".into());
        assert_eq!(topic.to_string(), "topic:abc");
        assert_eq!("topic:abc".parse::<ExpirerTarget>().unwrap(), topic);
        assert_eq!("id:42".parse::<ExpirerTarget>().unwrap(), ExpirerTarget::Id(42));
        assert!("session:abc".parse::<ExpirerTarget>().is_err());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let (expirer, _expired) = expirer().await;
        let target = ExpirerTarget::Id(1);
        expirer.set(&target, 10).await.unwrap();
        expirer.set(&target, 20).await.unwrap();
        assert_eq!(expirer.get(&target).await.unwrap().expiry, 20);
        assert_eq!(expirer.values().await.unwrap().len(), 1);

        expirer.del(&target).await.unwrap();
        expirer.del(&target).await.unwrap();
        assert!(matches!(expirer.get(&target).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sweep_emits_exactly_once() {
        let (expirer, mut expired_rx) = expirer().await;

        for id in 0..5 {
            expirer.set(&ExpirerTarget::Id(id), 100 + id).await.unwrap();
        }
        expirer
            .set(&ExpirerTarget::Topic("later".into()), 1_000)
            .await
            .unwrap();

        let expired = expirer.check_expirations(200).await.unwrap();
        assert_eq!(expired.len(), 5);
        assert!(expirer.check_expirations(200).await.unwrap().is_empty());
        assert!(expirer.has(&ExpirerTarget::Topic("later".into())).await.unwrap());

        let mut received = 0;
        while expired_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 5);
        for id in 0..5 {
            assert!(!expirer.has(&ExpirerTarget::Id(id)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_large_sweep_loses_nothing() {
        let (expirer, mut expired_rx) = expirer().await;
        for id in 0..1100 {
            expirer.set(&ExpirerTarget::Id(id), 10).await.unwrap();
        }

        assert_eq!(expirer.check_expirations(100).await.unwrap().len(), 1100);
        assert!(expirer.values().await.unwrap().is_empty());

        let mut ids = HashSet::new();
        while let Ok(expiration) = expired_rx.try_recv() {
            match expiration.target().unwrap() {
                ExpirerTarget::Id(id) => assert!(ids.insert(id)),
                other => panic!("unexpected target {other}"),
            }
        }
        assert_eq!(ids.len(), 1100);
    }
}
