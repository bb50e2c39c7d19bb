/// Types
///
/// Relay (`irn_*`) request types and the WalletConnect Sign payloads that
/// travel encrypted between peers. There are some tests with actual payloads
/// to ensure that the encoding matches other clients.
///
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cacao::Cacao;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrnTag {
    PairingDelete = 1000,
    PairingDeleteResponse = 1001,
    PairingPing = 1002,
    PairingPingResponse = 1003,

    SessionPropose = 1100,
    SessionProposeApproveResponse = 1101,
    SessionSettle = 1102,
    SessionSettleResponse = 1103,
    SessionUpdate = 1104,
    SessionUpdateResponse = 1105,
    SessionExtend = 1106,
    SessionExtendResponse = 1107,
    SessionRequest = 1108,
    SessionRequestResponse = 1109,
    SessionEvent = 1110,
    SessionEventResponse = 1111,
    SessionDelete = 1112,
    SessionDeleteResponse = 1113,
    SessionPing = 1114,
    SessionPingResponse = 1115,
    SessionAuthenticate = 1116,
    SessionAuthenticateApproveResponse = 1117,
    SessionAuthenticateRejectResponse = 1118,
    SessionProposeRejectResponse = 1120,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JsonRpcMethod {
    #[serde(rename = "irn_publish")]
    IrnPublish,

    #[serde(rename = "irn_batchPublish")]
    IrnBatchPublish,

    #[serde(rename = "irn_subscribe")]
    IrnSubscribe,

    #[serde(rename = "irn_batchSubscribe")]
    IrnBatchSubscribe,

    #[serde(rename = "irn_unsubscribe")]
    IrnUnsubscribe,

    #[serde(rename = "irn_batchUnsubscribe")]
    IrnBatchUnsubscribe,

    #[serde(rename = "irn_subscription")]
    IrnSubscription,
}

impl Display for JsonRpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_plain::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&name)
    }
}

impl FromStr for JsonRpcMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(serde_plain::from_str(s)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrnPublishParams {
    pub topic: String,
    pub message: String,
    pub ttl: u64,
    pub tag: u16,
    pub prompt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrnSubscribeParams {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrnBatchSubscribeParams {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrnUnsubscribeParams {
    pub topic: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrnSubscriptionParams {
    pub id: String,
    pub data: IrnSubscriptionData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrnSubscriptionData {
    pub topic: String,
    pub message: String,
    #[serde(rename = "publishedAt")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            protocol: crate::constants::RELAY_DEFAULT_PROTOCOL.to_string(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub metadata: Metadata,
}

/// Chains, methods and events granted (or requested) for one namespace key.
/// The key is either a bare namespace (`eip155`) or a CAIP-2 chain id
/// (`eip155:1`), in which case `chains` may be left out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

pub type Namespaces = BTreeMap<String, Namespace>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionProposeParams {
    #[serde(rename = "requiredNamespaces")]
    pub required_namespaces: Namespaces,
    #[serde(rename = "optionalNamespaces", default)]
    pub optional_namespaces: Namespaces,
    pub relays: Vec<Relay>,
    pub proposer: Participant,
    #[serde(rename = "expiryTimestamp")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
    #[serde(rename = "pairingTopic")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_topic: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionProposeResponse {
    pub relay: Relay,
    #[serde(rename = "responderPublicKey")]
    pub responder_public_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSettleParams {
    pub relay: Relay,
    pub namespaces: Namespaces,
    pub controller: Participant,
    pub expiry: u64,
    #[serde(rename = "sessionProperties")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdateParams {
    pub namespaces: Namespaces,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionExtendParams {
    pub expiry: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRequestParams {
    pub request: SessionRequestObject,
    #[serde(rename = "chainId")]
    pub chain_id: String,
}

/// The chain RPC call itself; `params` is opaque to this crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRequestObject {
    pub method: String,
    pub params: Value,
    #[serde(rename = "expiryTimestamp")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEventParams {
    pub event: SessionEventObject,
    #[serde(rename = "chainId")]
    pub chain_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEventObject {
    pub name: String,
    pub data: Value,
}

/// Params of `wc_sessionDelete` and `wc_pairingDelete`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReasonParams {
    pub code: i64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionAuthenticateParams {
    #[serde(rename = "authPayload")]
    pub auth_payload: AuthPayload,
    pub requester: Participant,
    #[serde(rename = "expiryTimestamp")]
    pub expiry_timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(rename = "type", default = "default_auth_type")]
    pub payload_type: String,
    pub chains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    pub aud: String,
    pub domain: String,
    pub version: String,
    pub nonce: String,
    pub iat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(rename = "requestId")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

fn default_auth_type() -> String {
    "caip122".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionAuthenticateResponse {
    pub cacaos: Vec<Cacao>,
    pub responder: Participant,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_wc_session_propose() {
        let params: SessionProposeParams = serde_json::from_value(json!({
            "requiredNamespaces": {},
            "optionalNamespaces": {
                "eip155": {
                    "chains": ["eip155:1"],
                    "methods": ["personal_sign", "eth_sendTransaction"],
                    "events": ["chainChanged", "accountsChanged"]
                }
            },
            "relays": [{ "protocol": "irn" }],
            "proposer": {
                "publicKey": "dfdc0e4c0c2bd1c4dca1f2f9a8a6dfc2f7e0b7d16cbcf3e2d5e2e6a0a6e5e46c",
                "metadata": {
                    "name": "Example dApp",
                    "description": "",
                    "url": "https://example.org",
                    "icons": []
                }
            },
            "expiryTimestamp": 1749783095,
            "pairingTopic": "e4b9eb7a1372bf88abc46c37acac3687301afdfd0d2a4c2355945d66a1164464"
        }))
        .unwrap();

        let eip155 = &params.optional_namespaces["eip155"];
        assert!(eip155.accounts.is_empty());
        assert_eq!(eip155.chains, vec!["eip155:1"]);
        assert_eq!(params.expiry_timestamp, Some(1749783095));
        assert_eq!(params.relays, vec![Relay::default()]);
    }

    #[test]
    fn test_namespace_without_chains_round_trips() {
        let ns = Namespace {
            accounts: vec!["eip155:1:0xabc".into()],
            chains: vec![],
            methods: vec!["eth_sign".into()],
            events: vec![],
        };
        let encoded = serde_json::to_value(&ns).unwrap();
        assert_eq!(
            encoded,
            json!({"accounts": ["eip155:1:0xabc"], "methods": ["eth_sign"], "events": []})
        );
        assert_eq!(serde_json::from_value::<Namespace>(encoded).unwrap(), ns);
    }

    #[test]
    fn test_relay_method_names() {
        assert_eq!(JsonRpcMethod::IrnBatchSubscribe.to_string(), "irn_batchSubscribe");
        assert_eq!(
            "irn_subscription".parse::<JsonRpcMethod>().unwrap(),
            JsonRpcMethod::IrnSubscription
        );
    }
}
