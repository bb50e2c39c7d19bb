#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

use walletconnect_sign::config::{BackoffPolicy, RetryPolicy};
use walletconnect_sign::constants::{EXPIRER_STORAGE_KEY, KEYCHAIN_STORAGE_KEY};
use walletconnect_sign::crypto::{Crypto, DecodeOptions, EncodeOptions};
use walletconnect_sign::expirer::Expiration;
use walletconnect_sign::message::Message;
use walletconnect_sign::provider::TransportChannel;
use walletconnect_sign::storage::get_typed;
use walletconnect_sign::types::{Metadata, Namespace, Namespaces};
use walletconnect_sign::utils::{parse_uri, payload_id};
use walletconnect_sign::wc_message::{WcData, WcMessage};
use walletconnect_sign::{
    ClientOptions, KeyValueStorage, Lifetimes, MemoryStorage, Result, SignClient, SignEvent,
    Transport,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Stored {
    message: String,
    tag: u16,
    published_at: u64,
    publisher: usize,
}

#[derive(Default)]
struct RelayState {
    next_connection: usize,
    next_id: u64,
    connections: HashMap<usize, mpsc::UnboundedSender<String>>,
    // subscription id -> (connection, topic)
    subscriptions: HashMap<String, (usize, String)>,
    // messages nobody else has received yet
    mailboxes: HashMap<String, Vec<Stored>>,
    published: HashMap<String, usize>,
    // pushes go out after the reply to the frame that caused them
    outbox: Vec<(usize, String)>,
}

impl RelayState {
    fn push(&mut self, connection: usize, subscription: &str, topic: &str, stored: &Stored) {
        self.next_id += 1;
        let push = json!({
            "jsonrpc": "2.0",
            "id": self.next_id,
            "method": "irn_subscription",
            "params": {
                "id": subscription,
                "data": {
                    "topic": topic,
                    "message": stored.message,
                    "publishedAt": stored.published_at,
                    "tag": stored.tag,
                }
            }
        });
        self.outbox.push((connection, push.to_string()));
    }

    fn send(&self, connection: usize, frame: String) {
        if let Some(tx) = self.connections.get(&connection) {
            let _ = tx.send(frame);
        }
    }

    fn subscribe(&mut self, connection: usize, topic: &str) -> String {
        self.next_id += 1;
        let id = format!("sub-{}", self.next_id);
        self.subscriptions
            .insert(id.clone(), (connection, topic.to_string()));
        // deliver what was published before we got here
        let (theirs, ours): (Vec<Stored>, Vec<Stored>) = self
            .mailboxes
            .remove(topic)
            .unwrap_or_default()
            .into_iter()
            .partition(|m| m.publisher != connection);
        for message in &theirs {
            self.push(connection, &id, topic, message);
        }
        if !ours.is_empty() {
            self.mailboxes.insert(topic.to_string(), ours);
        }
        id
    }

    fn handle(&mut self, connection: usize, frame: &str) {
        let Ok(message) = serde_json::from_str::<Message>(frame) else {
            return;
        };
        // acks for our pushes
        let Some(method) = message.method.as_deref() else {
            return;
        };
        let params = message.params.clone().unwrap_or(Value::Null);

        let result = match method {
            "irn_publish" => {
                let topic = params["topic"].as_str().unwrap_or_default().to_string();
                let stored = Stored {
                    message: params["message"].as_str().unwrap_or_default().to_string(),
                    tag: params["tag"].as_u64().unwrap_or_default() as u16,
                    published_at: walletconnect_sign::utils::unix_timestamp(),
                    publisher: connection,
                };
                let targets: Vec<(String, usize)> = self
                    .subscriptions
                    .iter()
                    .filter(|(_, (c, t))| *t == topic && *c != connection)
                    .map(|(id, (c, _))| (id.clone(), *c))
                    .collect();
                *self.published.entry(topic.clone()).or_default() += 1;
                if targets.is_empty() {
                    self.mailboxes.entry(topic).or_default().push(stored);
                } else {
                    for (id, c) in targets {
                        self.push(c, &id, &topic, &stored);
                    }
                }
                json!(true)
            }
            "irn_subscribe" => {
                let topic = params["topic"].as_str().unwrap_or_default().to_string();
                json!(self.subscribe(connection, &topic))
            }
            "irn_batchSubscribe" => {
                let topics: Vec<String> = params["topics"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let ids: Vec<String> = topics
                    .iter()
                    .map(|topic| self.subscribe(connection, topic))
                    .collect();
                json!(ids)
            }
            "irn_unsubscribe" => {
                if let Some(id) = params["id"].as_str() {
                    self.subscriptions.remove(id);
                }
                json!(true)
            }
            _ => return,
        };

        let reply = json!({ "jsonrpc": "2.0", "id": message.id, "result": result });
        self.send(connection, reply.to_string());
        for (target, push) in std::mem::take(&mut self.outbox) {
            self.send(target, push);
        }
    }
}

/// In-process stand-in for the relay. Messages published while nobody else
/// listens on the topic are held until someone subscribes; nothing is echoed
/// back to the connection that published it.
#[derive(Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hangs up on every client, as a relay restart would.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock().unwrap();
        state.connections.clear();
        state.subscriptions.clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|(_, t)| t == topic)
            .count()
    }

    pub fn published_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .published
            .get(topic)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryRelay {
    async fn open(&self, _url: &str) -> Result<TransportChannel> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let connection = {
            let mut state = self.state.lock().unwrap();
            state.next_connection += 1;
            let connection = state.next_connection;
            state.connections.insert(connection, in_tx);
            connection
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let mut state = state.lock().unwrap();
                if !state.connections.contains_key(&connection) {
                    break;
                }
                state.handle(connection, &frame);
            }
            // client hung up
            let mut state = state.lock().unwrap();
            state.connections.remove(&connection);
            state.subscriptions.retain(|_, (c, _)| *c != connection);
        });

        Ok(TransportChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

pub fn metadata(name: &str) -> Metadata {
    Metadata {
        name: name.to_string(),
        description: format!("{name} test peer"),
        url: format!("https://{name}.example"),
        icons: vec![],
    }
}

pub async fn client(relay: &Arc<MemoryRelay>, name: &str) -> SignClient {
    client_with_storage(relay, name, Arc::new(MemoryStorage::new())).await
}

/// Same as `client`, over storage the caller keeps, to restart a client.
pub async fn client_with_storage(
    relay: &Arc<MemoryRelay>,
    name: &str,
    storage: Arc<MemoryStorage>,
) -> SignClient {
    client_with_options(relay, options(name), storage).await
}

pub async fn client_with_options(
    relay: &Arc<MemoryRelay>,
    options: ClientOptions,
    storage: Arc<MemoryStorage>,
) -> SignClient {
    SignClient::init(options, relay.clone(), storage)
        .await
        .unwrap()
}

pub fn options(name: &str) -> ClientOptions {
    let mut options =
        ClientOptions::new("test-project", metadata(name)).with_relay_url("wss://relay.test");
    options.reconnect = BackoffPolicy {
        base: Duration::from_millis(10),
        max: Duration::from_millis(50),
    };
    options.publish_retry = RetryPolicy {
        attempts: 5,
        initial_delay: Duration::from_millis(20),
    };
    options
}

/// `options` with the given lifetimes and an expirer that sweeps every 100ms.
pub fn short_lived(name: &str, lifetimes: Lifetimes) -> ClientOptions {
    let mut options = options(name);
    options.lifetimes = lifetimes;
    options.expirer_tick = Duration::from_millis(100);
    options
}

/// Targets the expirer has persisted, e.g. `topic:<topic>` or `id:<id>`.
pub async fn expirer_targets(storage: &MemoryStorage) -> Vec<String> {
    get_typed::<Vec<Expiration>>(storage, EXPIRER_STORAGE_KEY)
        .await
        .unwrap()
        .unwrap_or_default()
        .into_iter()
        .map(|e| e.target)
        .collect()
}

/// Whether the keychain still holds a key under `tag` (a topic or public key).
pub async fn has_key(storage: &MemoryStorage, tag: &str) -> bool {
    get_typed::<HashMap<String, String>>(storage, KEYCHAIN_STORAGE_KEY)
        .await
        .unwrap()
        .unwrap_or_default()
        .contains_key(tag)
}

/// Events already delivered, without waiting for more.
pub fn drain_events(events: &mut broadcast::Receiver<SignEvent>) -> Vec<SignEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return drained,
        }
    }
}

pub fn required_namespaces() -> Namespaces {
    [(
        "eip155".to_string(),
        Namespace {
            accounts: vec![],
            chains: vec!["eip155:1".into()],
            methods: vec!["eth_sign".into()],
            events: vec![],
        },
    )]
    .into()
}

pub fn approved_namespaces() -> Namespaces {
    [(
        "eip155".to_string(),
        Namespace {
            accounts: vec!["eip155:1:0xabc".into()],
            chains: vec![],
            methods: vec!["eth_sign".into()],
            events: vec!["chainChanged".into()],
        },
    )]
    .into()
}

/// Waits for the first event `pick` accepts, skipping the rest.
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<SignEvent>,
    mut pick: impl FnMut(SignEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Polls `check` until it holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held")
}

/// dApp proposes, wallet approves. Returns the session topic.
pub async fn establish_session(dapp: &SignClient, wallet: &SignClient) -> String {
    let mut wallet_events = wallet.events();
    let connect = dapp
        .connect(required_namespaces(), Namespaces::new(), None)
        .await
        .unwrap();
    wallet.pair(connect.uri.as_deref().unwrap()).await.unwrap();

    let id = next_event(&mut wallet_events, |e| match e {
        SignEvent::SessionProposal { id, .. } => Some(id),
        _ => None,
    })
    .await;
    wallet.approve(id, approved_namespaces(), None).await.unwrap();

    let session = tokio::time::timeout(TIMEOUT, connect.approval.wait())
        .await
        .unwrap()
        .unwrap();
    session.topic
}

/// A peer that talks to the relay directly with nothing but a pairing sym
/// key, to send what a `SignClient` never would.
pub struct RawPeer {
    crypto: Crypto,
    channel: TransportChannel,
    pub topic: String,
}

impl RawPeer {
    pub async fn join(relay: &Arc<MemoryRelay>, uri: &str) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        storage.init().await.unwrap();
        let crypto = Crypto::new(storage);
        crypto.init().await.unwrap();

        let params = parse_uri(uri).unwrap();
        crypto
            .set_sym_key(params.sym_key, Some(&params.topic))
            .await
            .unwrap();
        let channel = relay.open("wss://relay.test").await.unwrap();
        let peer = Self {
            crypto,
            channel,
            topic: params.topic,
        };
        peer.send("irn_subscribe", json!({ "topic": peer.topic }));
        peer
    }

    fn send(&self, method: &str, params: Value) {
        let frame = Message::request(payload_id(), method, params);
        self.channel
            .outgoing
            .send(serde_json::to_string(&frame).unwrap())
            .unwrap();
    }

    /// Publishes a peer request on the pairing topic and returns its id.
    pub async fn request(&self, data: WcData) -> u64 {
        let message = WcMessage::request(data);
        let raw = message.into_raw().unwrap();
        let encoded = self
            .crypto
            .encode(&self.topic, &raw, EncodeOptions::default())
            .await
            .unwrap();
        self.send(
            "irn_publish",
            json!({ "topic": self.topic, "message": encoded, "ttl": 300, "tag": 0 }),
        );
        message.id
    }

    /// Next message a peer published on the pairing topic, decrypted.
    pub async fn next_message(&mut self) -> Message {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let frame = self.channel.incoming.recv().await.expect("relay hung up");
                let push: Message = serde_json::from_str(&frame).unwrap();
                if push.method.as_deref() != Some("irn_subscription") {
                    continue;
                }
                let ack = Message::response(push.id, json!(true));
                self.channel
                    .outgoing
                    .send(serde_json::to_string(&ack).unwrap())
                    .unwrap();

                let params = push.params.unwrap();
                if params["data"]["topic"] != json!(self.topic) {
                    continue;
                }
                let encoded = params["data"]["message"].as_str().unwrap().to_string();
                let message: Message = self
                    .crypto
                    .decode(&self.topic, &encoded, DecodeOptions::default())
                    .await
                    .unwrap();
                return message;
            }
        })
        .await
        .expect("timed out waiting for a peer message")
    }
}
