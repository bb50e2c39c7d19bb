/// Relayer
///
/// Owns the relay connection: builds the authenticated relay URL, reconnects
/// with exponential backoff when the connection drops, resubscribes after
/// every (re)connect and turns `irn_subscription` pushes into
/// `RelayMessage`s for the engine.
///
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{AppIdentity, BackoffPolicy, ClientOptions};
use crate::constants::{
    RELAY_MESSAGE_MAX_TTL, RELAYER_PROTOCOL, RELAYER_PROTOCOL_VERSION, RELAYER_SDK_VERSION,
};
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::events::{EventBus, SignEvent};
use crate::message::Message;
use crate::provider::{JsonRpcProvider, ProviderEvent, Transport};
use crate::publisher::{PublishOptions, Publisher};
use crate::storage::KeyValueStorage;
use crate::subscriber::Subscriber;
use crate::types::{IrnSubscriptionParams, JsonRpcMethod};
use crate::utils::{sha256, unix_timestamp};

/// An encrypted payload delivered on one of our topics.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayMessage {
    pub topic: String,
    pub message: String,
    pub published_at: Option<u64>,
    pub tag: Option<u16>,
}

/// Remembers which payloads were already handed to the engine, per topic.
/// The relay delivers at least once, but drops a message once its ttl is
/// over, so hashes older than `RELAY_MESSAGE_MAX_TTL` are pruned.
#[derive(Debug, Default)]
pub struct MessageTracker {
    // topic -> payload hash -> first seen
    seen: Mutex<HashMap<String, HashMap<[u8; 32], u64>>>,
}

impl MessageTracker {
    /// `false` if this exact payload was seen on this topic before.
    pub async fn track(&self, topic: &str, message: &str) -> bool {
        self.track_at(topic, message, unix_timestamp()).await
    }

    pub async fn track_at(&self, topic: &str, message: &str, now: u64) -> bool {
        let mut seen = self.seen.lock().await;
        let hashes = seen.entry(topic.to_string()).or_default();
        let horizon = now.saturating_sub(RELAY_MESSAGE_MAX_TTL);
        hashes.retain(|_, seen_at| *seen_at > horizon);
        match hashes.entry(sha256(message)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub async fn forget(&self, topic: &str) {
        self.seen.lock().await.remove(topic);
    }
}

pub fn user_agent() -> String {
    format!(
        "{RELAYER_PROTOCOL}-{RELAYER_PROTOCOL_VERSION}/rust-{RELAYER_SDK_VERSION}/{}-unknown",
        std::env::consts::OS
    )
}

pub struct Relayer {
    relay_url: String,
    project_id: String,
    app_identity: Option<AppIdentity>,
    backoff: BackoffPolicy,
    crypto: Arc<Crypto>,
    provider: Arc<JsonRpcProvider>,
    subscriber: Subscriber,
    publisher: Publisher,
    tracker: MessageTracker,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    closing: AtomicBool,
    reconnecting: AtomicBool,
    events: EventBus,
}

impl Relayer {
    pub fn new(
        options: &ClientOptions,
        crypto: Arc<Crypto>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KeyValueStorage>,
        events: EventBus,
    ) -> Self {
        let (provider, notifications) = JsonRpcProvider::new(transport);
        let provider = Arc::new(provider);
        let relay_timeout = options.request_timeouts.relay;

        Self {
            relay_url: options.relay_url.clone(),
            project_id: options.project_id.clone(),
            app_identity: options.app_identity.clone(),
            backoff: options.reconnect.clone(),
            crypto,
            subscriber: Subscriber::new(provider.clone(), storage, relay_timeout),
            publisher: Publisher::new(
                provider.clone(),
                options.publish_retry.clone(),
                relay_timeout,
                events.clone(),
            ),
            provider,
            tracker: MessageTracker::default(),
            notifications: Mutex::new(Some(notifications)),
            closing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            events,
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.subscriber.init().await
    }

    pub fn provider(&self) -> &JsonRpcProvider {
        &self.provider
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    /// Relay URL carrying a freshly signed JWT.
    pub async fn relay_url(&self) -> Result<String> {
        let jwt = self.crypto.sign_jwt(&self.relay_url).await?;
        let mut url = Url::parse(&self.relay_url)
            .map_err(|e| Error::Format(format!("invalid relay url: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("auth", &jwt)
                .append_pair("projectId", &self.project_id)
                .append_pair("ua", &user_agent());
            if let Some(identity) = &self.app_identity {
                let (key, value) = identity.query_pair();
                query.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    pub async fn connect(&self) -> Result<()> {
        self.closing.store(false, Ordering::SeqCst);
        let url = self.relay_url().await?;
        self.provider.connect(&url).await
    }

    /// Closes the connection for good; no reconnect follows.
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.provider.disconnect().await;
    }

    /// Retries `connect` with exponential backoff until it succeeds or
    /// `disconnect` is called. Only one loop runs at a time.
    pub async fn reconnect(&self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut attempt = 0;
        while !self.closing.load(Ordering::SeqCst) {
            let delay = self.backoff.delay(attempt);
            debug!("reconnecting in {delay:?}");
            tokio::time::sleep(delay).await;
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            match self.connect().await {
                Ok(()) => break,
                Err(e) => {
                    warn!("reconnect attempt {} failed: {e}", attempt + 1);
                    attempt += 1;
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    pub async fn subscribe(&self, topic: &str) -> Result<String> {
        self.subscriber.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.tracker.forget(topic).await;
        self.subscriber.unsubscribe(topic).await
    }

    pub async fn publish(
        &self,
        topic: &str,
        message: &str,
        opts: PublishOptions,
    ) -> Result<()> {
        self.publisher.publish(topic, message, opts).await
    }

    /// Spawns the connection watcher and the push router. Must run before
    /// the first `connect` so the initial `Connected` is observed.
    pub async fn start(
        self: &Arc<Self>,
        out: mpsc::UnboundedSender<RelayMessage>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let notifications = self
            .notifications
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Transport("relayer already started".into()))?;

        let watcher = {
            let relayer = self.clone();
            let mut provider_events = self.provider.subscribe_events();
            tokio::spawn(async move {
                loop {
                    match provider_events.recv().await {
                        Ok(ProviderEvent::Connected) => {
                            relayer.events.emit(SignEvent::RelayConnected);
                            if let Err(e) = relayer.subscriber.resubscribe_all().await {
                                error!("resubscribe failed: {e}");
                            }
                        }
                        Ok(ProviderEvent::Disconnected) => {
                            relayer.events.emit(SignEvent::RelayDisconnected);
                            if !relayer.closing.load(Ordering::SeqCst) {
                                let relayer = relayer.clone();
                                tokio::spawn(async move { relayer.reconnect().await });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("missed {n} connection events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let router = {
            let relayer = self.clone();
            tokio::spawn(async move { relayer.route(notifications, out).await })
        };

        Ok(vec![watcher, router])
    }

    async fn route(
        &self,
        mut notifications: mpsc::UnboundedReceiver<Message>,
        out: mpsc::UnboundedSender<RelayMessage>,
    ) {
        while let Some(push) = notifications.recv().await {
            let method = push
                .method
                .as_deref()
                .and_then(|m| m.parse::<JsonRpcMethod>().ok());
            if method != Some(JsonRpcMethod::IrnSubscription) {
                warn!("unexpected relay request {:?}", push.method);
                continue;
            }

            // the relay keeps redelivering until acknowledged
            if let Err(e) = self.provider.respond(push.id, json!(true)).await {
                debug!("could not ack push {}: {e}", push.id);
            }

            let params: IrnSubscriptionParams =
                match serde_json::from_value(push.params.unwrap_or_default()) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("malformed irn_subscription: {e}");
                        continue;
                    }
                };

            let topic = match self.subscriber.topic_for(&params.id).await {
                Ok(Some(topic)) => topic,
                _ => match self.subscriber.is_known(&params.data.topic).await {
                    Ok(true) => params.data.topic.clone(),
                    _ => {
                        debug!("push for unknown subscription {}", params.id);
                        continue;
                    }
                },
            };

            if !self.tracker.track(&topic, &params.data.message).await {
                debug!("duplicate message on {topic}");
                continue;
            }

            let message = RelayMessage {
                topic,
                message: params.data.message,
                published_at: params.data.published_at,
                tag: params.data.tag,
            };
            if out.send(message).is_err() {
                info!("engine gone, stopping relay router");
                break;
            }
        }
    }
}
