/// SignClient
///
/// One client per app. `init` restores persisted state, connects to the
/// relay and starts three background tasks: the relay watcher/router, the
/// expirer ticker, and the dispatch loop that feeds relay messages and
/// expirations into the engine one at a time. Both feeds are unbounded
/// channels; nothing on them may be dropped.
///
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::cacao::Cacao;
use crate::config::ClientOptions;
use crate::crypto::Crypto;
use crate::engine::{
    AuthRequest, AuthRequestParams, AuthenticateResponse, ConnectResponse, PendingRequest,
    Proposal, Session, SignEngine,
};
use crate::error::Result;
use crate::events::{EventBus, SignEvent};
use crate::expirer::{Expiration, Expirer};
use crate::message::MessageError;
use crate::messenger::{Messenger, ResponseHandle};
use crate::pairing::{CreatedPairing, Pairing, PairingInfo};
use crate::provider::Transport;
use crate::relayer::{RelayMessage, Relayer};
use crate::storage::KeyValueStorage;
use crate::types::{Namespaces, ReasonParams, SessionEventObject, SessionRequestObject};

#[derive(Clone)]
pub struct SignClient {
    inner: Arc<Inner>,
}

struct Inner {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    pairing: Arc<Pairing>,
    engine: Arc<SignEngine>,
    events: EventBus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignClient {
    /// Use `WsTransport` and `FileStorage` (or `MemoryStorage`) outside of
    /// tests.
    pub async fn init(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Self> {
        storage.init().await?;
        let events = EventBus::default();

        let crypto = Arc::new(Crypto::new(storage.clone()));
        crypto.init().await?;
        let (expirer, expirations) = Expirer::new(storage.clone());
        let expirer = Arc::new(expirer);
        expirer.init().await?;
        let relayer = Arc::new(Relayer::new(
            &options,
            crypto.clone(),
            transport,
            storage.clone(),
            events.clone(),
        ));
        relayer.init().await?;
        let messenger = Arc::new(Messenger::new(
            crypto.clone(),
            relayer.clone(),
            options.request_timeouts.clone(),
        ));
        let pairing = Arc::new(Pairing::new(
            crypto.clone(),
            relayer.clone(),
            messenger.clone(),
            expirer.clone(),
            storage.clone(),
            options.lifetimes.clone(),
            events.clone(),
        ));
        pairing.init().await?;
        let engine = Arc::new(SignEngine::new(
            options.metadata.clone(),
            options.lifetimes.clone(),
            crypto.clone(),
            relayer.clone(),
            messenger,
            expirer.clone(),
            pairing.clone(),
            storage,
            events.clone(),
        ));
        engine.init().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = relayer.start(tx).await?;
        tasks.push(tokio::spawn(dispatch(engine.clone(), rx, expirations)));
        tasks.push(expirer.clone().start(options.expirer_tick));

        if let Err(e) = relayer.connect().await {
            warn!("relay unreachable ({e}), retrying in the background");
            let relayer = relayer.clone();
            tasks.push(tokio::spawn(async move { relayer.reconnect().await }));
        }
        info!("sign client {} ready", crypto.get_client_id().await?);

        Ok(Self {
            inner: Arc::new(Inner {
                crypto,
                relayer,
                pairing,
                engine,
                events,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// A fresh receiver; drop it to unsubscribe.
    pub fn events(&self) -> broadcast::Receiver<SignEvent> {
        self.inner.events.subscribe()
    }

    /// `did:key` the relay knows this client by.
    pub async fn client_id(&self) -> Result<String> {
        self.inner.crypto.get_client_id().await
    }

    pub async fn create_pairing(&self, methods: Option<Vec<String>>) -> Result<CreatedPairing> {
        self.inner.engine.create_pairing(methods).await
    }

    pub async fn pair(&self, uri: &str) -> Result<PairingInfo> {
        self.inner.engine.pair(uri).await
    }

    pub async fn ping_pairing(&self, topic: &str) -> Result<()> {
        self.inner.pairing.ping(topic).await
    }

    pub async fn connect(
        &self,
        required_namespaces: Namespaces,
        optional_namespaces: Namespaces,
        pairing_topic: Option<&str>,
    ) -> Result<ConnectResponse> {
        self.inner
            .engine
            .connect(required_namespaces, optional_namespaces, pairing_topic)
            .await
    }

    pub async fn approve(
        &self,
        id: u64,
        namespaces: Namespaces,
        session_properties: Option<Value>,
    ) -> Result<Session> {
        self.inner
            .engine
            .approve(id, namespaces, session_properties)
            .await
    }

    pub async fn reject(&self, id: u64, reason: ReasonParams) -> Result<()> {
        self.inner.engine.reject(id, reason).await
    }

    pub async fn request(
        &self,
        topic: &str,
        chain_id: &str,
        request: SessionRequestObject,
    ) -> Result<Value> {
        self.inner.engine.request(topic, chain_id, request).await
    }

    /// Like `request`, but hands back the handle so the caller can keep
    /// the id around (e.g. to `cancel_request` it).
    pub async fn send_request(
        &self,
        topic: &str,
        chain_id: &str,
        request: SessionRequestObject,
    ) -> Result<ResponseHandle> {
        self.inner.engine.send_request(topic, chain_id, request).await
    }

    pub async fn cancel_request(&self, id: u64) -> Result<bool> {
        self.inner.engine.cancel_request(id).await
    }

    pub async fn respond(
        &self,
        topic: &str,
        id: u64,
        response: std::result::Result<Value, MessageError>,
    ) -> Result<()> {
        self.inner.engine.respond(topic, id, response).await
    }

    pub async fn emit(
        &self,
        topic: &str,
        chain_id: &str,
        event: SessionEventObject,
    ) -> Result<()> {
        self.inner.engine.emit(topic, chain_id, event).await
    }

    pub async fn update(&self, topic: &str, namespaces: Namespaces) -> Result<()> {
        self.inner.engine.update(topic, namespaces).await
    }

    pub async fn extend(&self, topic: &str) -> Result<u64> {
        self.inner.engine.extend(topic).await
    }

    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.inner.engine.ping(topic).await
    }

    pub async fn disconnect(&self, topic: &str, reason: ReasonParams) -> Result<()> {
        self.inner.engine.disconnect(topic, reason).await
    }

    pub async fn authenticate(
        &self,
        params: AuthRequestParams,
        pairing_topic: Option<&str>,
    ) -> Result<AuthenticateResponse> {
        self.inner.engine.authenticate(params, pairing_topic).await
    }

    pub async fn approve_session_authenticate(&self, id: u64, cacaos: Vec<Cacao>) -> Result<()> {
        self.inner
            .engine
            .approve_session_authenticate(id, cacaos)
            .await
    }

    pub async fn reject_session_authenticate(&self, id: u64, reason: ReasonParams) -> Result<()> {
        self.inner
            .engine
            .reject_session_authenticate(id, reason)
            .await
    }

    pub async fn sessions(&self) -> Result<Vec<Session>> {
        self.inner.engine.sessions().await
    }

    pub async fn session(&self, topic: &str) -> Result<Session> {
        self.inner.engine.get_session(topic).await
    }

    pub async fn pairings(&self) -> Result<Vec<PairingInfo>> {
        self.inner.engine.pairings().await
    }

    pub async fn proposals(&self) -> Result<Vec<Proposal>> {
        self.inner.engine.proposals().await
    }

    /// Inbound session requests still waiting for `respond`.
    pub async fn pending_requests(&self) -> Result<Vec<PendingRequest>> {
        self.inner.engine.pending_requests().await
    }

    pub async fn auth_requests(&self) -> Result<Vec<AuthRequest>> {
        self.inner.engine.auth_requests().await
    }

    /// Closes the relay connection and stops the background tasks.
    /// Persisted state stays for the next `init`.
    pub async fn shutdown(&self) {
        self.inner.relayer.disconnect().await;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("sign client stopped");
    }
}

async fn dispatch(
    engine: Arc<SignEngine>,
    mut messages: mpsc::UnboundedReceiver<RelayMessage>,
    mut expirations: mpsc::UnboundedReceiver<Expiration>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => engine.on_relay_message(message).await,
                None => break,
            },
            expiration = expirations.recv() => match expiration {
                Some(expiration) => match expiration.target() {
                    Ok(target) => engine.on_expired(target).await,
                    Err(e) => warn!("bad expirer target {}: {e}", expiration.target),
                },
                None => break,
            },
        }
    }
}
