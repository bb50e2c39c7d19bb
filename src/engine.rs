/// Engine
///
/// The sign protocol on top of pairings: session proposals and settlement,
/// requests and events over a settled session, and the one-shot
/// `wc_sessionAuthenticate` exchange.
///
/// Every inbound message and every expiry goes through `on_relay_message` /
/// `on_expired`, which the client calls from a single dispatch task. Those
/// two and every public operation that changes state take the `mutations`
/// lock for their whole check-then-act, so none of them interleave. The lock
/// is held across relay acknowledgements but never while waiting for the
/// peer, whose response can only arrive through the dispatch task.
///
/// ```text
/// dApp                                   wallet
///  connect() --- wc_sessionPropose ----->  SessionProposal event
///                                          approve()
///  <---------- propose result (pubkey) ---
///  <---------- wc_sessionSettle ----------
///  settle result ------------------------>  acknowledged
///  approval resolves
/// ```
///
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex, oneshot};

use crate::cacao::Cacao;
use crate::config::Lifetimes;
use crate::constants::{
    AUTH_KEY_STORAGE_KEY, AUTH_REQUEST_STORAGE_KEY, MINUTES, NO_MATCHING_KEY_CODE,
    PROPOSAL_STORAGE_KEY, REQUEST_STORAGE_KEY, SESSION_STORAGE_KEY,
    UNAUTHORIZED_EVENT_CODE, UNAUTHORIZED_EXTEND_CODE, UNAUTHORIZED_METHOD_CODE,
    UNAUTHORIZED_UPDATE_CODE, UNSUPPORTED_NAMESPACE_CODE,
};
use crate::crypto::{Crypto, DecodeOptions, EncodeOptions};
use crate::error::{Error, Result};
use crate::events::{EventBus, SignEvent};
use crate::expirer::{Expirer, ExpirerTarget};
use crate::message::MessageError;
use crate::messenger::{Messenger, ResponseHandle};
use crate::namespaces::{
    check_event, check_method, check_superset, validate_proposal_namespaces,
    validate_session_namespaces,
};
use crate::pairing::{CreatedPairing, Pairing, PairingInfo};
use crate::relayer::{RelayMessage, Relayer};
use crate::storage::KeyValueStorage;
use crate::store::{Store, StoreEntry};
use crate::types::{
    AuthPayload, Metadata, Namespaces, Participant, ReasonParams, Relay,
    SessionAuthenticateParams, SessionAuthenticateResponse, SessionEventObject,
    SessionEventParams, SessionExtendParams, SessionProposeParams, SessionProposeResponse,
    SessionRequestObject, SessionRequestParams, SessionSettleParams, SessionUpdateParams,
};
use crate::utils::{decode_key, hash_key, unix_timestamp};
use crate::wc_message::{WcData, WcMessage, WcMethod};

/// A settled session, as both peers store it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub topic: String,
    pub pairing_topic: String,
    pub relay: Relay,
    pub expiry: u64,
    /// The dApp acknowledged `wc_sessionSettle`. Always true on the dApp.
    pub acknowledged: bool,
    /// Public key of the wallet, the only side allowed to update or extend.
    pub controller: String,
    #[serde(rename = "self")]
    pub self_participant: Participant,
    pub peer: Participant,
    pub namespaces: Namespaces,
    #[serde(default)]
    pub required_namespaces: Namespaces,
    #[serde(default)]
    pub optional_namespaces: Namespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<Value>,
}

impl Session {
    pub fn is_controller(&self) -> bool {
        self.controller == self.self_participant.public_key
    }
}

impl StoreEntry for Session {
    fn key(&self) -> String {
        self.topic.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: u64,
    pub pairing_topic: String,
    pub expiry: u64,
    pub params: SessionProposeParams,
}

impl StoreEntry for Proposal {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A `wc_sessionRequest` in flight. `outbound` is true on the side that
/// sent it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: u64,
    pub topic: String,
    pub method: String,
    pub params: Value,
    pub chain_id: String,
    pub expiry: u64,
    pub outbound: bool,
}

impl StoreEntry for PendingRequest {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Wallet side of `wc_sessionAuthenticate`, waiting for the user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub id: u64,
    pub pairing_topic: String,
    pub expiry: u64,
    pub params: SessionAuthenticateParams,
}

impl StoreEntry for AuthRequest {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Key for decoding the type 1 envelope that answers our authenticate
/// request, keyed by the response topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthKey {
    topic: String,
    public_key: String,
}

impl StoreEntry for AuthKey {
    fn key(&self) -> String {
        self.topic.clone()
    }
}

/// Resolves once the peer settles (or refuses) what we asked for.
#[derive(Debug)]
pub struct Approval<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Approval<T> {
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[derive(Debug)]
pub struct ConnectResponse {
    /// `None` when an existing pairing was reused.
    pub uri: Option<String>,
    pub pairing_topic: String,
    pub id: u64,
    pub approval: Approval<Session>,
}

/// What to ask the wallet to sign in `authenticate`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthRequestParams {
    pub chains: Vec<String>,
    pub domain: String,
    pub uri: String,
    pub nonce: String,
    pub statement: Option<String>,
    pub resources: Vec<String>,
}

#[derive(Debug)]
pub struct AuthenticateResponse {
    pub uri: Option<String>,
    pub pairing_topic: String,
    pub id: u64,
    pub approval: Approval<SessionAuthenticateResponse>,
}

struct AuthWaiter {
    tx: oneshot::Sender<Result<SessionAuthenticateResponse>>,
    response_topic: String,
    public_key: String,
    pairing_topic: String,
}

pub struct SignEngine {
    metadata: Metadata,
    lifetimes: Lifetimes,
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    messenger: Arc<Messenger>,
    expirer: Arc<Expirer>,
    pairing: Arc<Pairing>,
    sessions: Store<Session>,
    proposals: Store<Proposal>,
    requests: Store<PendingRequest>,
    auth_requests: Store<AuthRequest>,
    auth_keys: Store<AuthKey>,
    // proposal id -> dApp waiting in connect()
    approvals: Mutex<HashMap<u64, oneshot::Sender<Result<Session>>>>,
    // session topic -> proposal id, between propose result and settle
    settle_waiters: Mutex<HashMap<String, u64>>,
    auth_waiters: Mutex<HashMap<u64, AuthWaiter>>,
    mutations: Mutex<()>,
    events: EventBus,
}

impl SignEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Metadata,
        lifetimes: Lifetimes,
        crypto: Arc<Crypto>,
        relayer: Arc<Relayer>,
        messenger: Arc<Messenger>,
        expirer: Arc<Expirer>,
        pairing: Arc<Pairing>,
        storage: Arc<dyn KeyValueStorage>,
        events: EventBus,
    ) -> Self {
        Self {
            metadata,
            lifetimes,
            crypto,
            relayer,
            messenger,
            expirer,
            pairing,
            sessions: Store::new("session", SESSION_STORAGE_KEY, storage.clone()),
            proposals: Store::new("proposal", PROPOSAL_STORAGE_KEY, storage.clone()),
            requests: Store::new("request", REQUEST_STORAGE_KEY, storage.clone()),
            auth_requests: Store::new("auth_request", AUTH_REQUEST_STORAGE_KEY, storage.clone()),
            auth_keys: Store::new("auth_key", AUTH_KEY_STORAGE_KEY, storage),
            approvals: Mutex::new(HashMap::new()),
            settle_waiters: Mutex::new(HashMap::new()),
            auth_waiters: Mutex::new(HashMap::new()),
            mutations: Mutex::new(()),
            events,
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.sessions.init().await?;
        self.proposals.init().await?;
        self.requests.init().await?;
        self.auth_requests.init().await?;
        self.auth_keys.init().await?;
        Ok(())
    }

    fn participant(&self, public_key: String) -> Participant {
        Participant {
            public_key,
            metadata: self.metadata.clone(),
        }
    }

    async fn session(&self, topic: &str) -> Result<Session> {
        self.sessions
            .try_get(topic)
            .await?
            .ok_or_else(|| Error::SessionNotFound(topic.to_string()))
    }

    /// Proposes a session. Returns right away; `approval` resolves when the
    /// wallet settles, rejects, or the proposal expires.
    pub async fn connect(
        &self,
        required_namespaces: Namespaces,
        optional_namespaces: Namespaces,
        pairing_topic: Option<&str>,
    ) -> Result<ConnectResponse> {
        validate_proposal_namespaces(&required_namespaces)?;
        validate_proposal_namespaces(&optional_namespaces)?;

        let _guard = self.mutations.lock().await;
        let (uri, pairing_topic) = match pairing_topic {
            Some(topic) => (None, self.pairing.get(topic).await?.topic),
            None => {
                let created = self.pairing.create(None).await?;
                (Some(created.uri), created.topic)
            }
        };

        let public_key = self.crypto.generate_key_pair().await?;
        let expiry = unix_timestamp() + self.lifetimes.proposal;
        let params = SessionProposeParams {
            required_namespaces,
            optional_namespaces,
            relays: vec![Relay::default()],
            proposer: self.participant(public_key.clone()),
            expiry_timestamp: Some(expiry),
            pairing_topic: Some(pairing_topic.clone()),
        };
        let message = WcMessage::request(WcData::SessionPropose(params.clone()));
        let id = message.id;

        self.proposals
            .set(Proposal {
                id,
                pairing_topic: pairing_topic.clone(),
                expiry,
                params,
            })
            .await?;
        self.expirer.set(&ExpirerTarget::Id(id), expiry).await?;

        let (tx, rx) = oneshot::channel();
        self.approvals.lock().await.insert(id, tx);

        if let Err(e) = self.messenger.send_request(&pairing_topic, message).await {
            self.approvals.lock().await.remove(&id);
            self.proposals.delete(&id.to_string()).await?;
            self.expirer.del(&ExpirerTarget::Id(id)).await?;
            self.crypto.delete_key_pair(&public_key).await?;
            return Err(e);
        }
        info!("proposed session {id} on pairing {pairing_topic}");

        Ok(ConnectResponse {
            uri,
            pairing_topic,
            id,
            approval: Approval { rx },
        })
    }

    async fn fail_proposal(&self, id: u64, reason: Error) -> Result<()> {
        if let Some(proposal) = self.proposals.delete(&id.to_string()).await? {
            self.crypto
                .delete_key_pair(&proposal.params.proposer.public_key)
                .await?;
        }
        self.expirer.del(&ExpirerTarget::Id(id)).await?;
        self.settle_waiters.lock().await.retain(|_, waiting| *waiting != id);
        if let Some(tx) = self.approvals.lock().await.remove(&id) {
            let _ = tx.send(Err(reason));
        }
        Ok(())
    }

    async fn on_propose_response(&self, id: u64, message: &WcMessage) -> Result<()> {
        let Some(proposal) = self.proposals.try_get(&id.to_string()).await? else {
            debug!("propose response for unknown proposal {id}");
            return Ok(());
        };

        match &message.data {
            WcData::Result(value) => {
                let accepted = async {
                    let response: SessionProposeResponse =
                        serde_json::from_value(value.clone())?;
                    let session_topic = self
                        .crypto
                        .generate_shared_key(
                            &proposal.params.proposer.public_key,
                            &response.responder_public_key,
                            None,
                        )
                        .await?;
                    self.settle_waiters
                        .lock()
                        .await
                        .insert(session_topic.clone(), id);
                    self.relayer.subscribe(&session_topic).await?;
                    Ok::<_, Error>(session_topic)
                }
                .await;
                match accepted {
                    Ok(topic) => debug!("proposal {id} accepted, awaiting settle on {topic}"),
                    Err(e) => {
                        warn!("could not follow up on accepted proposal {id}: {e}");
                        self.fail_proposal(id, e).await?;
                    }
                }
            }
            WcData::Error(error) => {
                info!("proposal {id} rejected: {:?}", error.message);
                let reason = Error::Rejected {
                    code: error.code.unwrap_or_default(),
                    message: error.message.clone().unwrap_or_default(),
                };
                self.fail_proposal(id, reason).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_session_settle(
        &self,
        topic: &str,
        id: u64,
        params: SessionSettleParams,
    ) -> Result<()> {
        let waiting = self.settle_waiters.lock().await.remove(topic);
        let Some(proposal_id) = waiting else {
            warn!("settle on {topic} matches no proposal");
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionSettle,
                    MessageError::new(NO_MATCHING_KEY_CODE, "no proposal for this settle"),
                    None,
                )
                .await;
        };
        let proposal = self.proposals.get(&proposal_id.to_string()).await?;

        let approved = validate_session_namespaces(&params.namespaces)
            .and_then(|_| check_superset(&proposal.params.required_namespaces, &params.namespaces));
        if let Err(e) = approved {
            warn!("refusing settle for proposal {proposal_id}: {e}");
            self.messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionSettle,
                    MessageError::new(UNSUPPORTED_NAMESPACE_CODE, e.to_string()),
                    None,
                )
                .await?;
            if let Err(e) = self.relayer.unsubscribe(topic).await {
                warn!("unsubscribe {topic} failed: {e}");
            }
            self.crypto.delete_sym_key(topic).await?;
            return self.fail_proposal(proposal_id, e).await;
        }

        let session = Session {
            topic: topic.to_string(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: params.relay,
            expiry: params.expiry,
            acknowledged: true,
            controller: params.controller.public_key.clone(),
            self_participant: proposal.params.proposer.clone(),
            peer: params.controller.clone(),
            namespaces: params.namespaces,
            required_namespaces: proposal.params.required_namespaces,
            optional_namespaces: proposal.params.optional_namespaces,
            session_properties: params.session_properties,
        };
        self.sessions.set(session.clone()).await?;
        self.expirer
            .set(&ExpirerTarget::Topic(topic.to_string()), session.expiry)
            .await?;
        self.messenger
            .send_result(topic, id, WcMethod::SessionSettle, json!(true), None)
            .await?;

        if let Err(e) = self.pairing.activate(&proposal.pairing_topic).await {
            warn!("could not activate pairing {}: {e}", proposal.pairing_topic);
        }
        self.pairing
            .update_metadata(&proposal.pairing_topic, params.controller.metadata)
            .await?;
        self.proposals.delete(&proposal_id.to_string()).await?;
        self.expirer.del(&ExpirerTarget::Id(proposal_id)).await?;

        info!("session {topic} settled");
        if let Some(tx) = self.approvals.lock().await.remove(&proposal_id) {
            let _ = tx.send(Ok(session));
        }
        Ok(())
    }

    async fn on_session_propose(
        &self,
        topic: &str,
        id: u64,
        params: SessionProposeParams,
    ) -> Result<()> {
        let valid = validate_proposal_namespaces(&params.required_namespaces)
            .and_then(|_| validate_proposal_namespaces(&params.optional_namespaces));
        if let Err(e) = valid {
            warn!("refusing proposal {id}: {e}");
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionPropose,
                    MessageError::new(UNSUPPORTED_NAMESPACE_CODE, e.to_string()),
                    None,
                )
                .await;
        }

        let expiry = params
            .expiry_timestamp
            .unwrap_or_else(|| unix_timestamp() + self.lifetimes.proposal);
        self.proposals
            .set(Proposal {
                id,
                pairing_topic: topic.to_string(),
                expiry,
                params: params.clone(),
            })
            .await?;
        self.expirer.set(&ExpirerTarget::Id(id), expiry).await?;
        self.pairing
            .update_metadata(topic, params.proposer.metadata.clone())
            .await?;

        self.events.emit(SignEvent::SessionProposal { id, params });
        Ok(())
    }

    /// Settles proposal `id` with the accounts the user picked.
    pub async fn approve(
        &self,
        id: u64,
        namespaces: Namespaces,
        session_properties: Option<Value>,
    ) -> Result<Session> {
        let _guard = self.mutations.lock().await;
        let proposal = self.proposals.get(&id.to_string()).await?;
        validate_session_namespaces(&namespaces)?;
        check_superset(&proposal.params.required_namespaces, &namespaces)?;

        let self_public_key = self.crypto.generate_key_pair().await?;
        let session_topic = self
            .crypto
            .generate_shared_key(&self_public_key, &proposal.params.proposer.public_key, None)
            .await?;
        self.relayer.subscribe(&session_topic).await?;

        let relay = proposal.params.relays.first().cloned().unwrap_or_default();
        let response = SessionProposeResponse {
            relay: relay.clone(),
            responder_public_key: self_public_key.clone(),
        };
        self.messenger
            .send_result(
                &proposal.pairing_topic,
                id,
                WcMethod::SessionPropose,
                serde_json::to_value(&response)?,
                None,
            )
            .await?;

        let self_participant = self.participant(self_public_key.clone());
        let session = Session {
            topic: session_topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: relay.clone(),
            expiry: unix_timestamp() + self.lifetimes.session,
            acknowledged: false,
            controller: self_public_key,
            self_participant: self_participant.clone(),
            peer: proposal.params.proposer.clone(),
            namespaces: namespaces.clone(),
            required_namespaces: proposal.params.required_namespaces.clone(),
            optional_namespaces: proposal.params.optional_namespaces.clone(),
            session_properties: session_properties.clone(),
        };
        self.sessions.set(session.clone()).await?;
        self.expirer
            .set(&ExpirerTarget::Topic(session_topic.clone()), session.expiry)
            .await?;

        let settle = WcMessage::request(WcData::SessionSettle(SessionSettleParams {
            relay,
            namespaces,
            controller: self_participant,
            expiry: session.expiry,
            session_properties,
        }));
        // the dApp's answer is handled in dispatch, nobody waits on it here
        let handle = self.messenger.send_request(&session_topic, settle).await?;
        drop(handle);

        self.proposals.delete(&id.to_string()).await?;
        self.expirer.del(&ExpirerTarget::Id(id)).await?;
        if let Err(e) = self.pairing.activate(&proposal.pairing_topic).await {
            warn!("could not activate pairing {}: {e}", proposal.pairing_topic);
        }
        info!("approved proposal {id} as session {session_topic}");
        Ok(session)
    }

    /// The proposal is dropped even if telling the dApp fails.
    pub async fn reject(&self, id: u64, reason: ReasonParams) -> Result<()> {
        let _guard = self.mutations.lock().await;
        let proposal = self.proposals.get(&id.to_string()).await?;
        let sent = self
            .messenger
            .send_error(
                &proposal.pairing_topic,
                id,
                WcMethod::SessionPropose,
                MessageError::new(reason.code, reason.message),
                None,
            )
            .await;
        self.proposals.delete(&id.to_string()).await?;
        self.expirer.del(&ExpirerTarget::Id(id)).await?;
        info!("rejected proposal {id}");
        sent
    }

    async fn on_settle_response(&self, topic: &str, message: &WcMessage) -> Result<()> {
        match &message.data {
            WcData::Result(_) => {
                if self.sessions.contains(topic).await? {
                    self.sessions
                        .update(topic, |s| s.acknowledged = true)
                        .await?;
                    debug!("session {topic} acknowledged");
                }
            }
            WcData::Error(error) => {
                warn!("dApp refused settle on {topic}: {:?}", error.message);
                self.cleanup_session(topic).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Publishes a request and returns a handle to await the answer with.
    /// The method is checked against the session before anything is sent.
    pub async fn send_request(
        &self,
        topic: &str,
        chain_id: &str,
        request: SessionRequestObject,
    ) -> Result<ResponseHandle> {
        let _guard = self.mutations.lock().await;
        let session = self.session(topic).await?;
        check_method(&session.namespaces, &request.method, chain_id)?;

        let expiry = request
            .expiry_timestamp
            .unwrap_or_else(|| unix_timestamp() + self.lifetimes.session_request);
        let message = WcMessage::request(WcData::SessionRequest(SessionRequestParams {
            request: request.clone(),
            chain_id: chain_id.to_string(),
        }));
        let id = message.id;

        self.requests
            .set(PendingRequest {
                id,
                topic: topic.to_string(),
                method: request.method,
                params: request.params,
                chain_id: chain_id.to_string(),
                expiry,
                outbound: true,
            })
            .await?;
        self.expirer.set(&ExpirerTarget::Id(id), expiry).await?;

        match self.messenger.send_request(topic, message).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.requests.delete(&id.to_string()).await?;
                self.expirer.del(&ExpirerTarget::Id(id)).await?;
                Err(e)
            }
        }
    }

    pub async fn request(
        &self,
        topic: &str,
        chain_id: &str,
        request: SessionRequestObject,
    ) -> Result<Value> {
        let handle = self.send_request(topic, chain_id, request).await?;
        let id = handle.id;
        let result = handle.response().await;
        if matches!(result, Err(Error::Timeout)) {
            let _guard = self.mutations.lock().await;
            self.requests.delete(&id.to_string()).await?;
            self.expirer.del(&ExpirerTarget::Id(id)).await?;
        }
        result
    }

    /// Stops waiting for request `id`. The peer is not told.
    pub async fn cancel_request(&self, id: u64) -> Result<bool> {
        let _guard = self.mutations.lock().await;
        let cancelled = self.messenger.cancel(id).await;
        let tracked = self.requests.delete(&id.to_string()).await?.is_some();
        self.expirer.del(&ExpirerTarget::Id(id)).await?;
        Ok(cancelled || tracked)
    }

    async fn on_session_request(
        &self,
        topic: &str,
        id: u64,
        params: SessionRequestParams,
    ) -> Result<()> {
        let Some(session) = self.sessions.try_get(topic).await? else {
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionRequest,
                    MessageError::new(NO_MATCHING_KEY_CODE, "session not found"),
                    None,
                )
                .await;
        };
        if let Err(e) = check_method(&session.namespaces, &params.request.method, &params.chain_id)
        {
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionRequest,
                    MessageError::new(UNAUTHORIZED_METHOD_CODE, e.to_string()),
                    None,
                )
                .await;
        }

        let expiry = params
            .request
            .expiry_timestamp
            .unwrap_or_else(|| unix_timestamp() + self.lifetimes.session_request);
        self.requests
            .set(PendingRequest {
                id,
                topic: topic.to_string(),
                method: params.request.method.clone(),
                params: params.request.params.clone(),
                chain_id: params.chain_id.clone(),
                expiry,
                outbound: false,
            })
            .await?;
        self.expirer.set(&ExpirerTarget::Id(id), expiry).await?;

        self.events.emit(SignEvent::SessionRequest {
            id,
            topic: topic.to_string(),
            chain_id: params.chain_id,
            request: params.request,
        });
        Ok(())
    }

    /// Answers an inbound `wc_sessionRequest`.
    pub async fn respond(
        &self,
        topic: &str,
        id: u64,
        response: std::result::Result<Value, MessageError>,
    ) -> Result<()> {
        let _guard = self.mutations.lock().await;
        self.requests
            .try_get(&id.to_string())
            .await?
            .filter(|r| r.topic == topic && !r.outbound)
            .ok_or_else(|| Error::NotFound(format!("request {id} on {topic}")))?;

        match response {
            Ok(result) => {
                self.messenger
                    .send_result(topic, id, WcMethod::SessionRequest, result, None)
                    .await?
            }
            Err(error) => {
                self.messenger
                    .send_error(topic, id, WcMethod::SessionRequest, error, None)
                    .await?
            }
        }
        self.requests.delete(&id.to_string()).await?;
        self.expirer.del(&ExpirerTarget::Id(id)).await?;
        Ok(())
    }

    async fn round_trip(&self, topic: &str, data: WcData) -> Result<Value> {
        self.messenger
            .send_request(topic, WcMessage::request(data))
            .await?
            .response()
            .await
    }

    pub async fn emit(
        &self,
        topic: &str,
        chain_id: &str,
        event: SessionEventObject,
    ) -> Result<()> {
        let session = self.session(topic).await?;
        check_event(&session.namespaces, &event.name, chain_id)?;
        self.round_trip(
            topic,
            WcData::SessionEvent(SessionEventParams {
                event,
                chain_id: chain_id.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    /// Controller only. The local copy changes before the peer acknowledges.
    pub async fn update(&self, topic: &str, namespaces: Namespaces) -> Result<()> {
        {
            let _guard = self.mutations.lock().await;
            let session = self.session(topic).await?;
            if !session.is_controller() {
                return Err(Error::Unauthorized(format!(
                    "only the controller may update {topic}"
                )));
            }
            validate_session_namespaces(&namespaces)?;
            check_superset(&session.required_namespaces, &namespaces)?;

            self.sessions
                .update(topic, |s| s.namespaces = namespaces.clone())
                .await?;
        }
        self.round_trip(topic, WcData::SessionUpdate(SessionUpdateParams { namespaces }))
            .await?;
        Ok(())
    }

    /// Controller only. Pushes the expiry to a full session lifetime from
    /// now and returns it.
    pub async fn extend(&self, topic: &str) -> Result<u64> {
        let expiry = unix_timestamp() + self.lifetimes.session;
        {
            let _guard = self.mutations.lock().await;
            let session = self.session(topic).await?;
            if !session.is_controller() {
                return Err(Error::Unauthorized(format!(
                    "only the controller may extend {topic}"
                )));
            }
            self.set_session_expiry(topic, expiry).await?;
        }
        self.round_trip(topic, WcData::SessionExtend(SessionExtendParams { expiry }))
            .await?;
        Ok(expiry)
    }

    async fn set_session_expiry(&self, topic: &str, expiry: u64) -> Result<()> {
        self.sessions.update(topic, |s| s.expiry = expiry).await?;
        self.expirer
            .set(&ExpirerTarget::Topic(topic.to_string()), expiry)
            .await
    }

    /// Pings a session, or a pairing if `topic` is not a session.
    pub async fn ping(&self, topic: &str) -> Result<()> {
        if self.sessions.contains(topic).await? {
            self.round_trip(topic, WcData::SessionPing).await?;
            return Ok(());
        }
        if self.pairing.contains(topic).await? {
            return self.pairing.ping(topic).await;
        }
        Err(Error::SessionNotFound(topic.to_string()))
    }

    /// Tears down a session (or a pairing). Local state goes away whether
    /// or not the peer hears about it.
    pub async fn disconnect(&self, topic: &str, reason: ReasonParams) -> Result<()> {
        let _guard = self.mutations.lock().await;
        if self.sessions.contains(topic).await? {
            let delete = WcMessage::request(WcData::SessionDelete(reason));
            match self.messenger.send_request(topic, delete).await {
                Ok(handle) => self.messenger.forget(handle.id).await,
                Err(e) => warn!("could not notify peer of session delete: {e}"),
            }
            self.cleanup_session(topic).await?;
            info!("disconnected session {topic}");
            return Ok(());
        }
        if self.pairing.contains(topic).await? {
            return self.pairing.disconnect(topic).await;
        }
        Err(Error::SessionNotFound(topic.to_string()))
    }

    async fn cleanup_session(&self, topic: &str) -> Result<()> {
        let Some(session) = self.sessions.delete(topic).await? else {
            return Ok(());
        };
        if let Err(e) = self.relayer.unsubscribe(topic).await {
            warn!("unsubscribe {topic} failed: {e}");
        }
        self.crypto.delete_sym_key(topic).await?;
        self.crypto
            .delete_key_pair(&session.self_participant.public_key)
            .await?;
        self.expirer
            .del(&ExpirerTarget::Topic(topic.to_string()))
            .await?;

        for request in self.requests.values().await? {
            if request.topic == topic {
                self.requests.delete(&request.id.to_string()).await?;
                self.expirer.del(&ExpirerTarget::Id(request.id)).await?;
            }
        }
        self.messenger.fail_topic(topic).await;
        debug!("removed session {topic}");
        Ok(())
    }

    async fn reply_no_session(&self, topic: &str, id: u64, method: WcMethod) -> Result<()> {
        self.messenger
            .send_error(
                topic,
                id,
                method,
                MessageError::new(NO_MATCHING_KEY_CODE, "session not found"),
                None,
            )
            .await
    }

    async fn on_session_update(
        &self,
        topic: &str,
        id: u64,
        params: SessionUpdateParams,
    ) -> Result<()> {
        let Some(session) = self.sessions.try_get(topic).await? else {
            return self.reply_no_session(topic, id, WcMethod::SessionUpdate).await;
        };
        if session.is_controller() {
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionUpdate,
                    MessageError::new(UNAUTHORIZED_UPDATE_CODE, "peer is not the controller"),
                    None,
                )
                .await;
        }
        let valid = validate_session_namespaces(&params.namespaces)
            .and_then(|_| check_superset(&session.required_namespaces, &params.namespaces));
        if let Err(e) = valid {
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionUpdate,
                    MessageError::new(UNSUPPORTED_NAMESPACE_CODE, e.to_string()),
                    None,
                )
                .await;
        }

        self.sessions
            .update(topic, |s| s.namespaces = params.namespaces.clone())
            .await?;
        self.messenger
            .send_result(topic, id, WcMethod::SessionUpdate, json!(true), None)
            .await?;
        self.events.emit(SignEvent::SessionUpdate {
            id,
            topic: topic.to_string(),
            namespaces: params.namespaces,
        });
        Ok(())
    }

    async fn on_session_extend(
        &self,
        topic: &str,
        id: u64,
        params: SessionExtendParams,
    ) -> Result<()> {
        let Some(session) = self.sessions.try_get(topic).await? else {
            return self.reply_no_session(topic, id, WcMethod::SessionExtend).await;
        };
        let now = unix_timestamp();
        // a minute of leeway for clock skew between the peers
        let latest = now + self.lifetimes.session + MINUTES;
        let in_range = params.expiry > now && params.expiry <= latest;
        if session.is_controller() || !in_range {
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionExtend,
                    MessageError::new(UNAUTHORIZED_EXTEND_CODE, "extend refused"),
                    None,
                )
                .await;
        }

        self.set_session_expiry(topic, params.expiry).await?;
        self.messenger
            .send_result(topic, id, WcMethod::SessionExtend, json!(true), None)
            .await?;
        self.events.emit(SignEvent::SessionExtend {
            id,
            topic: topic.to_string(),
            expiry: params.expiry,
        });
        Ok(())
    }

    async fn on_session_event(
        &self,
        topic: &str,
        id: u64,
        params: SessionEventParams,
    ) -> Result<()> {
        let Some(session) = self.sessions.try_get(topic).await? else {
            return self.reply_no_session(topic, id, WcMethod::SessionEvent).await;
        };
        if let Err(e) = check_event(&session.namespaces, &params.event.name, &params.chain_id) {
            return self
                .messenger
                .send_error(
                    topic,
                    id,
                    WcMethod::SessionEvent,
                    MessageError::new(UNAUTHORIZED_EVENT_CODE, e.to_string()),
                    None,
                )
                .await;
        }
        self.messenger
            .send_result(topic, id, WcMethod::SessionEvent, json!(true), None)
            .await?;
        self.events.emit(SignEvent::SessionEvent {
            id,
            topic: topic.to_string(),
            chain_id: params.chain_id,
            event: params.event,
        });
        Ok(())
    }

    async fn on_session_ping(&self, topic: &str, id: u64) -> Result<()> {
        if !self.sessions.contains(topic).await? {
            return self.reply_no_session(topic, id, WcMethod::SessionPing).await;
        }
        self.messenger
            .send_result(topic, id, WcMethod::SessionPing, json!(true), None)
            .await?;
        self.events.emit(SignEvent::SessionPing {
            id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn on_session_delete(&self, topic: &str, id: u64, reason: ReasonParams) -> Result<()> {
        if !self.sessions.contains(topic).await? {
            return self.reply_no_session(topic, id, WcMethod::SessionDelete).await;
        }
        info!("peer deleted session {topic}: {}", reason.message);
        if let Err(e) = self
            .messenger
            .send_result(topic, id, WcMethod::SessionDelete, json!(true), None)
            .await
        {
            warn!("could not acknowledge session delete: {e}");
        }
        self.cleanup_session(topic).await?;
        self.events.emit(SignEvent::SessionDelete {
            id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    /// Asks the wallet to sign a SIWE-style message for each chain. No
    /// session comes out of this; the approval yields the signed cacaos.
    pub async fn authenticate(
        &self,
        params: AuthRequestParams,
        pairing_topic: Option<&str>,
    ) -> Result<AuthenticateResponse> {
        if params.chains.is_empty() {
            return Err(Error::Format("authenticate needs at least one chain".into()));
        }

        let _guard = self.mutations.lock().await;
        let (uri, pairing_topic) = match pairing_topic {
            Some(topic) => (None, self.pairing.get(topic).await?.topic),
            None => {
                let created = self
                    .pairing
                    .create(Some(vec![WcMethod::SessionAuthenticate.to_string()]))
                    .await?;
                (Some(created.uri), created.topic)
            }
        };

        let public_key = self.crypto.generate_key_pair().await?;
        let response_topic = hash_key(&decode_key(&public_key)?);
        self.auth_keys
            .set(AuthKey {
                topic: response_topic.clone(),
                public_key: public_key.clone(),
            })
            .await?;
        self.relayer.subscribe(&response_topic).await?;

        let expiry = unix_timestamp() + self.lifetimes.auth_request;
        let auth_payload = AuthPayload {
            payload_type: "eip4361".to_string(),
            chains: params.chains,
            statement: params.statement,
            aud: params.uri,
            domain: params.domain,
            version: "1".to_string(),
            nonce: params.nonce,
            iat: OffsetDateTime::now_utc().format(&Rfc3339)?,
            exp: None,
            nbf: None,
            request_id: None,
            resources: params.resources,
        };
        let message = WcMessage::request(WcData::SessionAuthenticate(SessionAuthenticateParams {
            auth_payload,
            requester: self.participant(public_key.clone()),
            expiry_timestamp: expiry,
        }));
        let id = message.id;

        let (tx, rx) = oneshot::channel();
        self.auth_waiters.lock().await.insert(
            id,
            AuthWaiter {
                tx,
                response_topic: response_topic.clone(),
                public_key: public_key.clone(),
                pairing_topic: pairing_topic.clone(),
            },
        );
        self.expirer.set(&ExpirerTarget::Id(id), expiry).await?;

        if let Err(e) = self.messenger.send_request(&pairing_topic, message).await {
            if let Some(waiter) = self.auth_waiters.lock().await.remove(&id) {
                self.drop_auth_waiter(&waiter).await?;
            }
            self.expirer.del(&ExpirerTarget::Id(id)).await?;
            return Err(e);
        }
        info!("sent authenticate request {id} on pairing {pairing_topic}");

        Ok(AuthenticateResponse {
            uri,
            pairing_topic,
            id,
            approval: Approval { rx },
        })
    }

    async fn drop_auth_waiter(&self, waiter: &AuthWaiter) -> Result<()> {
        if let Err(e) = self.relayer.unsubscribe(&waiter.response_topic).await {
            warn!("unsubscribe {} failed: {e}", waiter.response_topic);
        }
        self.auth_keys.delete(&waiter.response_topic).await?;
        self.crypto.delete_key_pair(&waiter.public_key).await
    }

    fn verify_auth_response(value: Value) -> Result<SessionAuthenticateResponse> {
        let response: SessionAuthenticateResponse = serde_json::from_value(value)?;
        if response.cacaos.is_empty() {
            return Err(Error::Unauthorized("no cacao in response".into()));
        }
        for cacao in &response.cacaos {
            cacao.verify()?;
        }
        Ok(response)
    }

    async fn on_authenticate_response(&self, id: u64, message: &WcMessage) -> Result<()> {
        let Some(waiter) = self.auth_waiters.lock().await.remove(&id) else {
            return Ok(());
        };
        self.expirer.del(&ExpirerTarget::Id(id)).await?;
        self.drop_auth_waiter(&waiter).await?;

        let outcome = match &message.data {
            WcData::Result(value) => Self::verify_auth_response(value.clone()),
            WcData::Error(error) => Err(Error::Rejected {
                code: error.code.unwrap_or_default(),
                message: error.message.clone().unwrap_or_default(),
            }),
            _ => return Ok(()),
        };
        match &outcome {
            Ok(response) => {
                info!("authenticate {id} answered with {} cacaos", response.cacaos.len());
                if let Err(e) = self.pairing.activate(&waiter.pairing_topic).await {
                    warn!("could not activate pairing {}: {e}", waiter.pairing_topic);
                }
                self.pairing
                    .update_metadata(&waiter.pairing_topic, response.responder.metadata.clone())
                    .await?;
            }
            Err(e) => warn!("authenticate {id} failed: {e}"),
        }
        let _ = waiter.tx.send(outcome);
        Ok(())
    }

    async fn on_session_authenticate(
        &self,
        topic: &str,
        id: u64,
        params: SessionAuthenticateParams,
    ) -> Result<()> {
        if params.expiry_timestamp <= unix_timestamp() {
            debug!("ignoring expired authenticate request {id}");
            return Ok(());
        }
        self.auth_requests
            .set(AuthRequest {
                id,
                pairing_topic: topic.to_string(),
                expiry: params.expiry_timestamp,
                params: params.clone(),
            })
            .await?;
        self.expirer
            .set(&ExpirerTarget::Id(id), params.expiry_timestamp)
            .await?;
        self.pairing
            .update_metadata(topic, params.requester.metadata.clone())
            .await?;

        self.events.emit(SignEvent::SessionAuthenticate {
            id,
            topic: topic.to_string(),
            params,
        });
        Ok(())
    }

    /// Sends an answer to the requester's response topic in a type 1
    /// envelope, the only way to reach a key we share nothing with yet.
    async fn answer_authenticate(
        &self,
        request: &AuthRequest,
        answer: std::result::Result<Vec<Cacao>, MessageError>,
    ) -> Result<()> {
        let receiver = request.params.requester.public_key.clone();
        let response_topic = hash_key(&decode_key(&receiver)?);
        let self_public_key = self.crypto.generate_key_pair().await?;
        let opts = Some(EncodeOptions::type_1(self_public_key.clone(), receiver));

        let sent = match answer {
            Ok(cacaos) => {
                let response = SessionAuthenticateResponse {
                    cacaos,
                    responder: self.participant(self_public_key.clone()),
                };
                match serde_json::to_value(&response) {
                    Ok(result) => {
                        self.messenger
                            .send_result(
                                &response_topic,
                                request.id,
                                WcMethod::SessionAuthenticate,
                                result,
                                opts,
                            )
                            .await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(error) => {
                self.messenger
                    .send_error(
                        &response_topic,
                        request.id,
                        WcMethod::SessionAuthenticate,
                        error,
                        opts,
                    )
                    .await
            }
        };
        self.crypto.delete_key_pair(&self_public_key).await?;
        sent?;

        self.auth_requests.delete(&request.id.to_string()).await?;
        self.expirer.del(&ExpirerTarget::Id(request.id)).await
    }

    /// Wallet: answers request `id` with cacaos signed by the user.
    pub async fn approve_session_authenticate(&self, id: u64, cacaos: Vec<Cacao>) -> Result<()> {
        let _guard = self.mutations.lock().await;
        let request = self.auth_requests.get(&id.to_string()).await?;
        if cacaos.is_empty() {
            return Err(Error::Format("at least one cacao is required".into()));
        }
        for cacao in &cacaos {
            cacao.verify()?;
        }

        self.answer_authenticate(&request, Ok(cacaos)).await?;
        if let Err(e) = self.pairing.activate(&request.pairing_topic).await {
            warn!("could not activate pairing {}: {e}", request.pairing_topic);
        }
        info!("approved authenticate request {id}");
        Ok(())
    }

    pub async fn reject_session_authenticate(&self, id: u64, reason: ReasonParams) -> Result<()> {
        let _guard = self.mutations.lock().await;
        let request = self.auth_requests.get(&id.to_string()).await?;
        self.answer_authenticate(&request, Err(MessageError::new(reason.code, reason.message)))
            .await?;
        info!("rejected authenticate request {id}");
        Ok(())
    }

    pub async fn sessions(&self) -> Result<Vec<Session>> {
        self.sessions.values().await
    }

    pub async fn get_session(&self, topic: &str) -> Result<Session> {
        self.session(topic).await
    }

    pub async fn proposals(&self) -> Result<Vec<Proposal>> {
        self.proposals.values().await
    }

    pub async fn pending_requests(&self) -> Result<Vec<PendingRequest>> {
        Ok(self
            .requests
            .values()
            .await?
            .into_iter()
            .filter(|r| !r.outbound)
            .collect())
    }

    pub async fn auth_requests(&self) -> Result<Vec<AuthRequest>> {
        self.auth_requests.values().await
    }

    pub async fn pairings(&self) -> Result<Vec<PairingInfo>> {
        self.pairing.pairings().await
    }

    pub async fn create_pairing(&self, methods: Option<Vec<String>>) -> Result<CreatedPairing> {
        let _guard = self.mutations.lock().await;
        self.pairing.create(methods).await
    }

    pub async fn pair(&self, uri: &str) -> Result<PairingInfo> {
        let _guard = self.mutations.lock().await;
        self.pairing.pair(uri, false).await
    }

    /// Entry point for everything the relay delivers. Failures are logged
    /// and surfaced as `SignEvent::Error`; they never stop the dispatch loop.
    pub async fn on_relay_message(&self, message: RelayMessage) {
        let _guard = self.mutations.lock().await;
        let topic = message.topic.clone();
        if let Err(e) = self.handle_relay_message(message).await {
            error!("failed to handle message on {topic}: {e}");
            self.events.emit(SignEvent::Error {
                topic,
                reason: e.to_string(),
                data: None,
            });
        }
    }

    async fn handle_relay_message(&self, message: RelayMessage) -> Result<()> {
        let opts = match self.auth_keys.try_get(&message.topic).await? {
            Some(key) => DecodeOptions {
                receiver_public_key: Some(key.public_key),
            },
            None => DecodeOptions::default(),
        };
        let raw = self
            .messenger
            .decode(&message.topic, &message.message, opts)
            .await?;
        let decoded = WcMessage::try_from(raw)?;

        if decoded.is_request() {
            // the relay may echo our own publishes back to us
            if self.messenger.is_own_request(decoded.id).await {
                debug!("skipping own {decoded}");
                return Ok(());
            }
            self.on_request(&message.topic, decoded).await
        } else {
            self.on_response(decoded).await
        }
    }

    async fn on_request(&self, topic: &str, message: WcMessage) -> Result<()> {
        debug!("received {message} on {topic}");
        if message.method().is_some_and(|m| m.is_pairing_method()) {
            return self.pairing.on_request(topic, message).await;
        }

        let id = message.id;
        match message.data {
            WcData::SessionPropose(params) => self.on_session_propose(topic, id, params).await,
            WcData::SessionSettle(params) => self.on_session_settle(topic, id, params).await,
            WcData::SessionUpdate(params) => self.on_session_update(topic, id, params).await,
            WcData::SessionExtend(params) => self.on_session_extend(topic, id, params).await,
            WcData::SessionRequest(params) => self.on_session_request(topic, id, params).await,
            WcData::SessionEvent(params) => self.on_session_event(topic, id, params).await,
            WcData::SessionPing => self.on_session_ping(topic, id).await,
            WcData::SessionDelete(reason) => self.on_session_delete(topic, id, reason).await,
            WcData::SessionAuthenticate(params) => {
                self.on_session_authenticate(topic, id, params).await
            }
            other => Err(Error::Format(format!(
                "unexpected request {:?} on {topic}",
                other.method()
            ))),
        }
    }

    async fn on_response(&self, message: WcMessage) -> Result<()> {
        let id = message.id;
        let Some(pending) = self.messenger.take(id).await else {
            debug!("response {id} matches no request");
            return Ok(());
        };
        debug!("received response to {}#{id}", pending.method);

        let handled = match pending.method {
            WcMethod::SessionPropose => self.on_propose_response(id, &message).await,
            WcMethod::SessionSettle => self.on_settle_response(&pending.topic, &message).await,
            WcMethod::SessionAuthenticate => self.on_authenticate_response(id, &message).await,
            WcMethod::SessionRequest => {
                let removed = self.requests.delete(&id.to_string()).await;
                match removed {
                    Ok(_) => self.expirer.del(&ExpirerTarget::Id(id)).await,
                    Err(e) => Err(e),
                }
            }
            _ => Ok(()),
        };
        pending.resolve(message.into_result());
        handled
    }

    /// Entry point for the expirer.
    pub async fn on_expired(&self, target: ExpirerTarget) {
        let _guard = self.mutations.lock().await;
        if let Err(e) = self.handle_expired(&target).await {
            error!("failed to expire {target}: {e}");
        }
    }

    async fn handle_expired(&self, target: &ExpirerTarget) -> Result<()> {
        match target {
            ExpirerTarget::Topic(topic) => {
                if let Some(session) = self.sessions.try_get(topic).await? {
                    // extended after the sweep picked up the old expiry
                    if session.expiry > unix_timestamp() {
                        debug!("session {topic} was extended, keeping it");
                        return Ok(());
                    }
                    self.cleanup_session(topic).await?;
                    info!("session {topic} expired");
                    self.events.emit(SignEvent::SessionExpire {
                        topic: topic.clone(),
                    });
                } else if !self.pairing.on_expired(topic).await? {
                    debug!("expired topic {topic} is unknown");
                }
            }
            ExpirerTarget::Id(id) => {
                let id = *id;
                let key = id.to_string();
                if self.proposals.contains(&key).await? {
                    self.messenger.forget(id).await;
                    let ours = self.approvals.lock().await.contains_key(&id);
                    if ours {
                        self.fail_proposal(id, Error::Timeout).await?;
                    } else {
                        self.proposals.delete(&key).await?;
                    }
                    info!("proposal {id} expired");
                    self.events.emit(SignEvent::ProposalExpire { id });
                } else if let Some(request) = self.requests.delete(&key).await? {
                    if request.outbound {
                        if let Some(pending) = self.messenger.take(id).await {
                            pending.resolve(Err(Error::Timeout));
                        }
                    }
                    self.events.emit(SignEvent::SessionRequestExpire { id });
                } else if self.auth_requests.delete(&key).await?.is_some() {
                    debug!("authenticate request {id} expired");
                } else {
                    let waiter = self.auth_waiters.lock().await.remove(&id);
                    if let Some(waiter) = waiter {
                        self.messenger.forget(id).await;
                        self.drop_auth_waiter(&waiter).await?;
                        let _ = waiter.tx.send(Err(Error::Timeout));
                        debug!("authenticate {id} timed out");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn participant(public_key: &str) -> Participant {
        Participant {
            public_key: public_key.into(),
            metadata: Metadata::default(),
        }
    }

    #[test]
    fn test_session_record_shape() {
        let session = Session {
            topic: "t".into(),
            pairing_topic: "p".into(),
            relay: Relay::default(),
            expiry: 1,
            acknowledged: false,
            controller: "aa".into(),
            self_participant: participant("aa"),
            peer: participant("bb"),
            namespaces: Namespaces::new(),
            required_namespaces: Namespaces::new(),
            optional_namespaces: Namespaces::new(),
            session_properties: None,
        };
        assert!(session.is_controller());

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["self"]["publicKey"], json!("aa"));
        assert_eq!(value["pairingTopic"], json!("p"));
        assert!(value.get("sessionProperties").is_none());
        let back: Session = serde_json::from_value(value).unwrap();
        assert_eq!(back, session);
    }

    #[tokio::test]
    async fn test_dropped_approval_is_cancelled() {
        let (tx, rx) = oneshot::channel::<Result<Session>>();
        drop(tx);
        assert!(matches!(Approval { rx }.wait().await, Err(Error::Cancelled)));
    }

    #[test]
    fn test_auth_response_needs_a_cacao() {
        let response = json!({
            "cacaos": [],
            "responder": { "publicKey": "aa", "metadata": Metadata::default() }
        });
        assert!(matches!(
            SignEngine::verify_auth_response(response),
            Err(Error::Unauthorized(_))
        ));
    }
}
