/// Pairing
///
/// Lifecycle of pairings: the long-lived channel keyed by the sym key in a
/// `wc:` URI, over which sessions are proposed.
///
/// ```text
/// create()/pair(uri) -> inactive (5 min) -> activate() -> active (30 days)
///                                 \-> expired | deleted
/// ```
///
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Lifetimes;
use crate::constants::{
    PAIRING_STORAGE_KEY, PAIRING_URI_VERSION, USER_DISCONNECTED_CODE,
    USER_DISCONNECTED_MESSAGE,
};
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::events::{EventBus, SignEvent};
use crate::expirer::{Expirer, ExpirerTarget};
use crate::messenger::Messenger;
use crate::relayer::Relayer;
use crate::storage::KeyValueStorage;
use crate::store::{Store, StoreEntry};
use crate::types::{Metadata, ReasonParams, Relay};
use crate::utils::{
    RelayProtocolOptions, UriParameters, format_uri, parse_uri, random_bytes32,
    unix_timestamp,
};
use crate::wc_message::{WcData, WcMessage, WcMethod};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingInfo {
    pub topic: String,
    pub relay: Relay,
    pub expiry: u64,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

impl StoreEntry for PairingInfo {
    fn key(&self) -> String {
        self.topic.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedPairing {
    pub topic: String,
    pub uri: String,
}

pub struct Pairing {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    messenger: Arc<Messenger>,
    expirer: Arc<Expirer>,
    store: Store<PairingInfo>,
    lifetimes: Lifetimes,
    events: EventBus,
}

impl Pairing {
    pub fn new(
        crypto: Arc<Crypto>,
        relayer: Arc<Relayer>,
        messenger: Arc<Messenger>,
        expirer: Arc<Expirer>,
        storage: Arc<dyn KeyValueStorage>,
        lifetimes: Lifetimes,
        events: EventBus,
    ) -> Self {
        Self {
            crypto,
            relayer,
            messenger,
            expirer,
            store: Store::new("pairing", PAIRING_STORAGE_KEY, storage),
            lifetimes,
            events,
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.store.init().await
    }

    /// New inactive pairing with a fresh sym key, and the URI to hand the
    /// peer.
    pub async fn create(&self, methods: Option<Vec<String>>) -> Result<CreatedPairing> {
        let sym_key = random_bytes32();
        let topic = self.crypto.set_sym_key(sym_key, None).await?;
        let expiry = unix_timestamp() + self.lifetimes.pairing_inactive;
        let relay = Relay::default();

        self.store
            .set(PairingInfo {
                topic: topic.clone(),
                relay: relay.clone(),
                expiry,
                active: false,
                peer_metadata: None,
                methods: methods.clone(),
            })
            .await?;
        self.expirer
            .set(&ExpirerTarget::Topic(topic.clone()), expiry)
            .await?;
        self.relayer.subscribe(&topic).await?;

        let uri = format_uri(&UriParameters {
            topic: topic.clone(),
            version: PAIRING_URI_VERSION,
            sym_key,
            relay: RelayProtocolOptions {
                protocol: relay.protocol,
                data: relay.data,
            },
            methods,
            expiry_timestamp: Some(expiry),
        });
        info!("created pairing {topic}");
        Ok(CreatedPairing { topic, uri })
    }

    /// Pairs with a URI from the peer. Scanning the same URI twice returns
    /// the existing pairing.
    pub async fn pair(&self, uri: &str, activate: bool) -> Result<PairingInfo> {
        let params = parse_uri(uri)?;

        if let Some(existing) = self.store.try_get(&params.topic).await? {
            debug!("pairing {} already known", existing.topic);
            if activate && !existing.active {
                return self.activate(&existing.topic).await;
            }
            return Ok(existing);
        }

        let now = unix_timestamp();
        let expiry = match params.expiry_timestamp {
            Some(expiry) if expiry <= now => {
                return Err(Error::Format(format!(
                    "pairing uri expired at {expiry}"
                )));
            }
            Some(expiry) => expiry,
            None => now + self.lifetimes.pairing_inactive,
        };

        self.crypto
            .set_sym_key(params.sym_key, Some(&params.topic))
            .await?;
        let pairing = PairingInfo {
            topic: params.topic.clone(),
            relay: Relay {
                protocol: params.relay.protocol,
                data: params.relay.data,
            },
            expiry,
            active: false,
            peer_metadata: None,
            methods: params.methods,
        };
        self.store.set(pairing.clone()).await?;
        self.expirer
            .set(&ExpirerTarget::Topic(pairing.topic.clone()), expiry)
            .await?;
        self.relayer.subscribe(&pairing.topic).await?;
        info!("paired {}", pairing.topic);

        if activate {
            return self.activate(&pairing.topic).await;
        }
        Ok(pairing)
    }

    pub async fn activate(&self, topic: &str) -> Result<PairingInfo> {
        let expiry = unix_timestamp() + self.lifetimes.pairing_active;
        let pairing = self
            .store
            .update(topic, |p| {
                p.active = true;
                p.expiry = expiry;
            })
            .await?;
        self.expirer
            .set(&ExpirerTarget::Topic(topic.to_string()), expiry)
            .await?;
        debug!("activated pairing {topic}");
        Ok(pairing)
    }

    pub async fn update_metadata(&self, topic: &str, metadata: Metadata) -> Result<()> {
        let changed = self
            .store
            .try_get(topic)
            .await?
            .is_some_and(|p| p.peer_metadata.as_ref() != Some(&metadata));
        if changed {
            self.store
                .update(topic, |p| p.peer_metadata = Some(metadata.clone()))
                .await?;
            self.events.emit(SignEvent::PairingMetadata {
                topic: topic.to_string(),
                metadata,
            });
        }
        Ok(())
    }

    pub async fn get(&self, topic: &str) -> Result<PairingInfo> {
        self.store.get(topic).await
    }

    pub async fn contains(&self, topic: &str) -> Result<bool> {
        self.store.contains(topic).await
    }

    pub async fn pairings(&self) -> Result<Vec<PairingInfo>> {
        self.store.values().await
    }

    /// Round trip over the pairing topic.
    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.store.get(topic).await?;
        self.messenger
            .send_request(topic, WcMessage::request(WcData::PairingPing))
            .await?
            .response()
            .await?;
        Ok(())
    }

    /// Tells the peer (best effort) and removes the pairing locally either way.
    pub async fn disconnect(&self, topic: &str) -> Result<()> {
        self.store.get(topic).await?;
        let delete = WcMessage::request(WcData::PairingDelete(ReasonParams {
            code: USER_DISCONNECTED_CODE,
            message: USER_DISCONNECTED_MESSAGE.to_string(),
        }));
        match self.messenger.send_request(topic, delete).await {
            Ok(handle) => self.messenger.forget(handle.id).await,
            Err(e) => warn!("could not notify peer of pairing delete: {e}"),
        }
        self.cleanup(topic).await?;
        self.events.emit(SignEvent::PairingDeleted {
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn cleanup(&self, topic: &str) -> Result<()> {
        if let Err(e) = self.relayer.unsubscribe(topic).await {
            warn!("unsubscribe {topic} failed: {e}");
        }
        self.crypto.delete_sym_key(topic).await?;
        self.store.delete(topic).await?;
        self.expirer
            .del(&ExpirerTarget::Topic(topic.to_string()))
            .await?;
        self.messenger.fail_topic(topic).await;
        debug!("removed pairing {topic}");
        Ok(())
    }

    /// `wc_pairingPing` / `wc_pairingDelete` from the peer.
    pub async fn on_request(&self, topic: &str, message: WcMessage) -> Result<()> {
        match message.data {
            WcData::PairingPing => {
                self.messenger
                    .send_result(topic, message.id, WcMethod::PairingPing, json!(true), None)
                    .await?;
                self.events.emit(SignEvent::PairingPing {
                    id: message.id,
                    topic: topic.to_string(),
                });
            }
            WcData::PairingDelete(reason) => {
                info!("peer deleted pairing {topic}: {}", reason.message);
                if let Err(e) = self
                    .messenger
                    .send_result(topic, message.id, WcMethod::PairingDelete, json!(true), None)
                    .await
                {
                    warn!("could not acknowledge pairing delete: {e}");
                }
                self.cleanup(topic).await?;
                self.events.emit(SignEvent::PairingDeleted {
                    topic: topic.to_string(),
                });
            }
            other => {
                return Err(Error::Format(format!(
                    "{:?} is not a pairing request",
                    other.method()
                )));
            }
        }
        Ok(())
    }

    /// Returns `false` if the topic is not a pairing.
    pub async fn on_expired(&self, topic: &str) -> Result<bool> {
        let Some(pairing) = self.store.try_get(topic).await? else {
            return Ok(false);
        };
        // activated after the sweep picked up the old expiry
        if pairing.expiry > unix_timestamp() {
            debug!("pairing {topic} was extended, keeping it");
            return Ok(true);
        }
        self.cleanup(topic).await?;
        info!("pairing {topic} expired");
        self.events.emit(SignEvent::PairingExpired {
            topic: topic.to_string(),
        });
        Ok(true)
    }
}
