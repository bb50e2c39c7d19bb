/// Subscriber
///
/// Which topics we listen to on the relay, and under which subscription id.
/// The topic list is persisted so a restarted client can resubscribe.
///
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::constants::SUBSCRIBER_STORAGE_KEY;
use crate::error::{Error, Result};
use crate::provider::JsonRpcProvider;
use crate::storage::{KeyValueStorage, get_typed, set_typed};
use crate::types::{
    IrnBatchSubscribeParams, IrnSubscribeParams, IrnUnsubscribeParams, JsonRpcMethod,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    pub id: String,
}

/// Outcome of `resubscribe_all`, per topic.
#[derive(Debug, Default)]
pub struct ResubscribeReport {
    pub subscribed: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

pub struct Subscriber {
    provider: Arc<JsonRpcProvider>,
    storage: Arc<dyn KeyValueStorage>,
    // topic -> subscription id
    subscriptions: Mutex<Option<HashMap<String, String>>>,
    // topics with an irn_subscribe in flight
    pending: Mutex<HashSet<String>>,
    timeout: Duration,
}

impl Subscriber {
    pub fn new(
        provider: Arc<JsonRpcProvider>,
        storage: Arc<dyn KeyValueStorage>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            storage,
            subscriptions: Mutex::new(None),
            pending: Mutex::new(HashSet::new()),
            timeout,
        }
    }

    pub async fn init(&self) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.is_none() {
            let restored: Vec<Subscription> =
                get_typed(self.storage.as_ref(), SUBSCRIBER_STORAGE_KEY)
                    .await?
                    .unwrap_or_default();
            debug!("subscriber: restored {} topics", restored.len());
            *subscriptions = Some(restored.into_iter().map(|s| (s.topic, s.id)).collect());
        }
        Ok(())
    }

    async fn persist(&self, subscriptions: &HashMap<String, String>) -> Result<()> {
        let values: Vec<Subscription> = subscriptions
            .iter()
            .map(|(topic, id)| Subscription {
                topic: topic.clone(),
                id: id.clone(),
            })
            .collect();
        set_typed(self.storage.as_ref(), SUBSCRIBER_STORAGE_KEY, &values).await
    }

    async fn insert(&self, topic: &str, id: String) -> Result<()> {
        let mut guard = self.subscriptions.lock().await;
        let subscriptions = guard.as_mut().ok_or(Error::NotInitialized("subscriber"))?;
        subscriptions.insert(topic.to_string(), id);
        self.persist(subscriptions).await
    }

    /// Returns the relay subscription id. Topics we already hold are not
    /// subscribed again.
    pub async fn subscribe(&self, topic: &str) -> Result<String> {
        if let Some(id) = self.subscription_id(topic).await? {
            return Ok(id);
        }

        self.pending.lock().await.insert(topic.to_string());
        let result: Result<String> = self
            .provider
            .request(
                JsonRpcMethod::IrnSubscribe,
                &IrnSubscribeParams {
                    topic: topic.to_string(),
                },
                self.timeout,
            )
            .await;
        let inserted = match result {
            Ok(id) => self.insert(topic, id.clone()).await.map(|_| id),
            Err(e) => Err(e),
        };
        // cleared only once the mapping exists
        self.pending.lock().await.remove(topic);
        let id = inserted?;
        debug!("subscribed {topic} as {id}");
        Ok(id)
    }

    /// The mapping is dropped even if the relay call fails.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = {
            let mut guard = self.subscriptions.lock().await;
            let subscriptions =
                guard.as_mut().ok_or(Error::NotInitialized("subscriber"))?;
            let removed = subscriptions.remove(topic);
            if removed.is_some() {
                self.persist(subscriptions).await?;
            }
            removed
        };

        let Some(id) = removed else {
            return Ok(());
        };
        let _: bool = self
            .provider
            .request(
                JsonRpcMethod::IrnUnsubscribe,
                &IrnUnsubscribeParams {
                    topic: topic.to_string(),
                    id,
                },
                self.timeout,
            )
            .await?;
        debug!("unsubscribed {topic}");
        Ok(())
    }

    /// Re-issues every persisted subscription, batched when the relay
    /// allows it. Topics that fail are reported and do not hold up the rest.
    pub async fn resubscribe_all(&self) -> Result<ResubscribeReport> {
        let topics = self.topics().await?;
        let mut report = ResubscribeReport::default();
        if topics.is_empty() {
            return Ok(report);
        }

        let batch: Result<Vec<String>> = self
            .provider
            .request(
                JsonRpcMethod::IrnBatchSubscribe,
                &IrnBatchSubscribeParams {
                    topics: topics.clone(),
                },
                self.timeout,
            )
            .await;

        match batch {
            Ok(ids) if ids.len() == topics.len() => {
                let mut guard = self.subscriptions.lock().await;
                let subscriptions =
                    guard.as_mut().ok_or(Error::NotInitialized("subscriber"))?;
                for (topic, id) in topics.iter().zip(ids) {
                    // skip topics unsubscribed while the batch was in flight
                    if let Some(entry) = subscriptions.get_mut(topic) {
                        *entry = id;
                        report.subscribed.push(topic.clone());
                    }
                }
                self.persist(subscriptions).await?;
            }
            other => {
                if let Err(e) = other {
                    warn!("batch subscribe failed, falling back per topic: {e}");
                }
                for topic in topics {
                    let result: Result<String> = self
                        .provider
                        .request(
                            JsonRpcMethod::IrnSubscribe,
                            &IrnSubscribeParams {
                                topic: topic.clone(),
                            },
                            self.timeout,
                        )
                        .await;
                    match result {
                        Ok(id) => {
                            if self.is_subscribed(&topic).await? {
                                self.insert(&topic, id).await?;
                                report.subscribed.push(topic);
                            }
                        }
                        Err(e) => {
                            warn!("resubscribe {topic} failed: {e}");
                            report.failed.push((topic, e));
                        }
                    }
                }
            }
        }

        info!(
            "resubscribed {} topics, {} failed",
            report.subscribed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub async fn subscription_id(&self, topic: &str) -> Result<Option<String>> {
        let guard = self.subscriptions.lock().await;
        let subscriptions = guard.as_ref().ok_or(Error::NotInitialized("subscriber"))?;
        Ok(subscriptions.get(topic).cloned())
    }

    /// Reverse lookup for relay pushes
    pub async fn topic_for(&self, subscription_id: &str) -> Result<Option<String>> {
        let guard = self.subscriptions.lock().await;
        let subscriptions = guard.as_ref().ok_or(Error::NotInitialized("subscriber"))?;
        Ok(subscriptions
            .iter()
            .find(|(_, id)| id.as_str() == subscription_id)
            .map(|(topic, _)| topic.clone()))
    }

    pub async fn is_subscribed(&self, topic: &str) -> Result<bool> {
        Ok(self.subscription_id(topic).await?.is_some())
    }

    /// Subscribed, or about to be. Pushes can arrive before the relay's
    /// answer to `irn_subscribe` has been processed.
    pub async fn is_known(&self, topic: &str) -> Result<bool> {
        if self.pending.lock().await.contains(topic) {
            return Ok(true);
        }
        self.is_subscribed(topic).await
    }

    pub async fn topics(&self) -> Result<Vec<String>> {
        let guard = self.subscriptions.lock().await;
        let subscriptions = guard.as_ref().ok_or(Error::NotInitialized("subscriber"))?;
        Ok(subscriptions.keys().cloned().collect())
    }
}
