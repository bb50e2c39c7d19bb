/// Provider
///
/// JSON-RPC over a duplex connection to the relay. Requests are correlated
/// by id; requests made while disconnected are queued and replayed in order
/// on the next successful `connect`. Frames carrying a `method` are relay
/// pushes and go to the notification channel instead.
///
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::types::JsonRpcMethod;
use crate::utils::payload_id;

/// Both halves of an open connection, as text frames.
pub struct TransportChannel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to the relay. The connection is gone once `incoming`
/// yields `None`; dropping `outgoing` closes it from our side.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportChannel>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<TransportChannel> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                    warn!("websocket send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        debug!("websocket closed by relay: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("websocket receive error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(TransportChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderEvent {
    Connected,
    Disconnected,
}

struct Pending {
    tx: oneshot::Sender<Result<Value>>,
    sent: bool,
}

struct Inner {
    state: ConnectionState,
    // bumped on every connect/disconnect so a stale reader cannot tear down
    // a newer connection
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<(u64, String)>,
    pending: HashMap<u64, Pending>,
}

impl Inner {
    fn close(&mut self) {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.outgoing = None;

        let in_flight: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent)
            .map(|(id, _)| *id)
            .collect();
        for id in in_flight {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(Error::ConnectionClosed));
            }
        }
    }
}

pub struct JsonRpcProvider {
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<Inner>>,
    notifications: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<ProviderEvent>,
}

impl JsonRpcProvider {
    /// Also returns the receiver for relay pushes (`irn_subscription`).
    pub fn new(
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let provider = Self {
            transport,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                outgoing: None,
                queue: VecDeque::new(),
                pending: HashMap::new(),
            })),
            notifications,
            events,
        };
        (provider, notification_rx)
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    /// No-op unless disconnected. On failure the provider stays
    /// disconnected and the error is returned; retrying is up to the caller.
    pub async fn connect(&self, url: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Disconnected {
                return Ok(());
            }
            inner.state = ConnectionState::Connecting;
        }

        let channel = match self.transport.open(url).await {
            Ok(channel) => channel,
            Err(e) => {
                self.inner.lock().await.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.state = ConnectionState::Connected;
            inner.outgoing = Some(channel.outgoing.clone());

            let mut replayed = 0;
            while let Some((id, frame)) = inner.queue.pop_front() {
                if channel.outgoing.send(frame.clone()).is_err() {
                    inner.queue.push_front((id, frame));
                    break;
                }
                if let Some(pending) = inner.pending.get_mut(&id) {
                    pending.sent = true;
                }
                replayed += 1;
            }
            if replayed > 0 {
                debug!("replayed {replayed} queued requests");
            }
            inner.generation
        };

        info!("relay connected");
        tokio::spawn(Self::read_loop(
            self.inner.clone(),
            self.notifications.clone(),
            self.events.clone(),
            channel.incoming,
            generation,
        ));
        let _ = self.events.send(ProviderEvent::Connected);
        Ok(())
    }

    /// Rejects in-flight requests with `ConnectionClosed`. Requests that
    /// were never sent stay queued for the next connect.
    pub async fn disconnect(&self) {
        let was_open = {
            let mut inner = self.inner.lock().await;
            let was_open = inner.state != ConnectionState::Disconnected;
            inner.close();
            was_open
        };
        if was_open {
            info!("relay disconnected");
            let _ = self.events.send(ProviderEvent::Disconnected);
        }
    }

    async fn read_loop(
        inner: Arc<Mutex<Inner>>,
        notifications: mpsc::UnboundedSender<Message>,
        events: broadcast::Sender<ProviderEvent>,
        mut incoming: mpsc::UnboundedReceiver<String>,
        generation: u64,
    ) {
        while let Some(frame) = incoming.recv().await {
            if inner.lock().await.generation != generation {
                debug!("dropping frame from a closed connection");
                break;
            }
            let message: Message = match serde_json::from_str(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("dropping malformed relay frame: {e}");
                    continue;
                }
            };

            if message.is_request() {
                if notifications.send(message).is_err() {
                    debug!("no listener for relay notifications");
                }
                continue;
            }

            let pending = inner.lock().await.pending.remove(&message.id);
            match pending {
                Some(pending) => {
                    let _ = pending.tx.send(message.into_result());
                }
                None => warn!("response for unknown request id {}", message.id),
            }
        }

        let mut inner = inner.lock().await;
        if inner.generation == generation {
            inner.close();
            drop(inner);
            warn!("relay connection lost");
            let _ = events.send(ProviderEvent::Disconnected);
        }
    }

    pub async fn request<P, R>(
        &self,
        method: JsonRpcMethod,
        params: &P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = payload_id();
        let frame = serde_json::to_string(&Message::request(
            id,
            method.to_string(),
            serde_json::to_value(params)?,
        ))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            let sent = match (&inner.state, &inner.outgoing) {
                (ConnectionState::Connected, Some(outgoing)) => {
                    outgoing.send(frame.clone()).is_ok()
                }
                _ => false,
            };
            if !sent {
                debug!("queueing {method}#{id} until connected");
                inner.queue.push_back((id, frame));
            }
            inner.pending.insert(id, Pending { tx, sent });
        }

        let value = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                let mut inner = self.inner.lock().await;
                inner.pending.remove(&id);
                inner.queue.retain(|(queued, _)| *queued != id);
                return Err(Error::Timeout);
            }
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Answers a relay push. Acks are not queued; without a connection the
    /// relay will redeliver anyway.
    pub async fn respond(&self, id: u64, result: Value) -> Result<()> {
        let frame = serde_json::to_string(&Message::response(id, result))?;
        let inner = self.inner.lock().await;
        match &inner.outgoing {
            Some(outgoing) => outgoing
                .send(frame)
                .map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex as StdMutex;

    use super::*;

    type Handler = dyn Fn(&Message) -> Option<Value> + Send + Sync;

    /// Relay stand-in that answers every request through `handler` and
    /// records what it was sent. `None` from the handler means no answer.
    pub(crate) struct ScriptedTransport {
        handler: Arc<Handler>,
        pub(crate) frames: Arc<StdMutex<Vec<Message>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(
            handler: impl Fn(&Message) -> Option<Value> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Arc::new(handler),
                frames: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        pub(crate) fn methods(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.method.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _url: &str) -> Result<TransportChannel> {
            let (c2s_tx, mut c2s_rx) = mpsc::unbounded_channel::<String>();
            let (s2c_tx, s2c_rx) = mpsc::unbounded_channel::<String>();
            let handler = self.handler.clone();
            let frames = self.frames.clone();
            tokio::spawn(async move {
                while let Some(frame) = c2s_rx.recv().await {
                    let message: Message = serde_json::from_str(&frame).unwrap();
                    frames.lock().unwrap().push(message.clone());
                    if let Some(result) = handler(&message) {
                        let reply = Message::response(message.id, result);
                        let _ = s2c_tx.send(serde_json::to_string(&reply).unwrap());
                    }
                }
            });
            Ok(TransportChannel {
                outgoing: c2s_tx,
                incoming: s2c_rx,
            })
        }
    }
}
