/// Messenger
///
/// Encrypts and publishes peer messages, and keeps the table of our
/// outstanding requests so responses arriving through the dispatch loop can
/// be matched back to whoever is waiting for them.
///
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};

use crate::config::RequestTimeouts;
use crate::crypto::{Crypto, DecodeOptions, EncodeOptions};
use crate::error::{Error, Result};
use crate::message::{Message, MessageError};
use crate::relayer::Relayer;
use crate::wc_message::{WcData, WcMessage, WcMethod};

type PendingMap = Arc<Mutex<HashMap<u64, PendingResponse>>>;

/// One of our requests still waiting for the peer.
#[derive(Debug)]
pub struct PendingResponse {
    pub id: u64,
    pub topic: String,
    pub method: WcMethod,
    tx: oneshot::Sender<Result<Value>>,
}

impl PendingResponse {
    /// Hands the outcome to the waiting caller, if it is still waiting.
    pub fn resolve(self, result: Result<Value>) {
        if self.tx.send(result).is_err() {
            debug!("nobody waiting for {}#{}", self.method, self.id);
        }
    }
}

/// Caller side of a published request.
#[derive(Debug)]
pub struct ResponseHandle {
    pub id: u64,
    pub topic: String,
    pub method: WcMethod,
    rx: oneshot::Receiver<Result<Value>>,
    timeout: Duration,
    pending: PendingMap,
}

impl ResponseHandle {
    /// Waits for the peer's answer. A JSON-RPC error from the peer comes
    /// back as `Error::Network`.
    pub async fn response(self) -> Result<Value> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&self.id);
                Err(Error::Timeout)
            }
        }
    }
}

pub struct Messenger {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    pending: PendingMap,
    timeouts: RequestTimeouts,
}

impl Messenger {
    pub fn new(crypto: Arc<Crypto>, relayer: Arc<Relayer>, timeouts: RequestTimeouts) -> Self {
        Self {
            crypto,
            relayer,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeouts,
        }
    }

    pub async fn decode(
        &self,
        topic: &str,
        encoded: &str,
        opts: DecodeOptions,
    ) -> Result<Message> {
        self.crypto.decode(topic, encoded, opts).await
    }

    /// Publishes a request built with `WcMessage::request`. The pending
    /// entry is registered before publishing so a fast answer is not lost.
    pub async fn send_request(
        &self,
        topic: &str,
        message: WcMessage,
    ) -> Result<ResponseHandle> {
        let method = message
            .method()
            .ok_or_else(|| Error::Format(format!("{message} is not a request")))?;
        let raw = message.into_raw()?;
        let encoded = self
            .crypto
            .encode(topic, &raw, EncodeOptions::default())
            .await?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            message.id,
            PendingResponse {
                id: message.id,
                topic: topic.to_string(),
                method,
                tx,
            },
        );

        if let Err(e) = self
            .relayer
            .publish(topic, &encoded, method.request_options())
            .await
        {
            self.pending.lock().await.remove(&message.id);
            return Err(e);
        }
        debug!("sent {message} on {topic}");

        Ok(ResponseHandle {
            id: message.id,
            topic: topic.to_string(),
            method,
            rx,
            timeout: self.timeouts.for_method(method),
            pending: self.pending.clone(),
        })
    }

    async fn send_response(
        &self,
        topic: &str,
        message: WcMessage,
        method: WcMethod,
        opts: Option<EncodeOptions>,
    ) -> Result<()> {
        let publish_opts = match message.data {
            WcData::Error(_) => method.reject_options(),
            _ => method.response_options(),
        };
        let raw = message.into_raw()?;
        let encoded = self
            .crypto
            .encode(topic, &raw, opts.unwrap_or_default())
            .await?;
        self.relayer.publish(topic, &encoded, publish_opts).await?;
        debug!("answered {method}#{} on {topic}", message.id);
        Ok(())
    }

    pub async fn send_result(
        &self,
        topic: &str,
        id: u64,
        method: WcMethod,
        result: Value,
        opts: Option<EncodeOptions>,
    ) -> Result<()> {
        self.send_response(topic, WcMessage::response(id, result), method, opts)
            .await
    }

    pub async fn send_error(
        &self,
        topic: &str,
        id: u64,
        method: WcMethod,
        error: MessageError,
        opts: Option<EncodeOptions>,
    ) -> Result<()> {
        self.send_response(topic, WcMessage::error(id, error), method, opts)
            .await
    }

    /// Removes and returns the pending entry for a response id.
    pub async fn take(&self, id: u64) -> Option<PendingResponse> {
        self.pending.lock().await.remove(&id)
    }

    pub async fn is_own_request(&self, id: u64) -> bool {
        self.pending.lock().await.contains_key(&id)
    }

    /// Stops tracking a request nobody will wait for.
    pub async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Fails the waiter with `Cancelled`. The peer is not told.
    pub async fn cancel(&self, id: u64) -> bool {
        match self.take(id).await {
            Some(pending) => {
                pending.resolve(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fails every request still waiting on `topic`, e.g. after the session
    /// behind it is gone.
    pub async fn fail_topic(&self, topic: &str) {
        let failed: Vec<PendingResponse> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<u64> = pending
                .values()
                .filter(|p| p.topic == topic)
                .map(|p| p.id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for pending in failed {
            pending.resolve(Err(Error::SessionNotFound(topic.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ClientOptions;
    use crate::events::EventBus;
    use crate::provider::testing::ScriptedTransport;
    use crate::storage::{KeyValueStorage, MemoryStorage};
    use crate::types::{Metadata, ReasonParams};
    use crate::utils::random_bytes32;

    async fn messenger() -> (Messenger, String) {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        storage.init().await.unwrap();
        let crypto = Arc::new(Crypto::new(storage.clone()));
        crypto.init().await.unwrap();
        let topic = crypto.set_sym_key(random_bytes32(), None).await.unwrap();

        let relayer = Arc::new(Relayer::new(
            &ClientOptions::new("p1d", Metadata::default()),
            crypto.clone(),
            Arc::new(ScriptedTransport::new(|_| Some(json!(true)))),
            storage,
            EventBus::default(),
        ));
        relayer.init().await.unwrap();
        relayer.connect().await.unwrap();

        let messenger = Messenger::new(crypto, relayer, RequestTimeouts::default());
        (messenger, topic)
    }

    #[tokio::test]
    async fn test_response_reaches_the_waiting_request() {
        let (messenger, topic) = messenger().await;
        let handle = messenger
            .send_request(&topic, WcMessage::request(WcData::SessionPing))
            .await
            .unwrap();
        let id = handle.id;
        assert!(messenger.is_own_request(id).await);

        let pending = messenger.take(id).await.unwrap();
        assert_eq!(pending.method, WcMethod::SessionPing);
        assert!(!messenger.is_own_request(id).await);
        pending.resolve(Ok(json!(true)));
        assert_eq!(handle.response().await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_fail_topic_wakes_waiters() {
        let (messenger, topic) = messenger().await;
        let delete = WcMessage::request(WcData::SessionDelete(ReasonParams {
            code: 6000,
            message: "bye".into(),
        }));
        let handle = messenger.send_request(&topic, delete).await.unwrap();

        messenger.fail_topic(&topic).await;
        assert!(matches!(
            handle.response().await,
            Err(Error::SessionNotFound(t)) if t == topic
        ));
        assert!(!messenger.cancel(12).await);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_published() {
        let (messenger, _) = messenger().await;
        let result = messenger
            .send_request("nope", WcMessage::request(WcData::SessionPing))
            .await;
        assert!(matches!(result, Err(Error::Crypto(_))));
    }
}
