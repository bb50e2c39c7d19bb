use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
    constants::{DAYS, HOURS, MINUTES},
    error::{Error, Result},
    message::{Message, MessageError},
    publisher::PublishOptions,
    types::{
        IrnTag, ReasonParams, SessionAuthenticateParams, SessionEventParams,
        SessionExtendParams, SessionProposeParams, SessionRequestParams,
        SessionSettleParams, SessionUpdateParams,
    },
    utils::payload_id,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcMethod {
    #[serde(rename = "wc_pairingDelete")]
    PairingDelete,

    #[serde(rename = "wc_pairingPing")]
    PairingPing,

    #[serde(rename = "wc_sessionPropose")]
    SessionPropose,

    #[serde(rename = "wc_sessionSettle")]
    SessionSettle,

    #[serde(rename = "wc_sessionUpdate")]
    SessionUpdate,

    #[serde(rename = "wc_sessionExtend")]
    SessionExtend,

    #[serde(rename = "wc_sessionRequest")]
    SessionRequest,

    #[serde(rename = "wc_sessionEvent")]
    SessionEvent,

    #[serde(rename = "wc_sessionDelete")]
    SessionDelete,

    #[serde(rename = "wc_sessionPing")]
    SessionPing,

    #[serde(rename = "wc_sessionAuthenticate")]
    SessionAuthenticate,
}

impl Display for WcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_plain::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(&name)
    }
}

impl FromStr for WcMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(serde_plain::from_str(s)?)
    }
}

const fn opts(ttl: u64, tag: IrnTag, prompt: bool) -> PublishOptions {
    PublishOptions { ttl, tag, prompt }
}

// https://specs.walletconnect.com/2.0/specs/clients/sign/rpc-methods#methods
impl WcMethod {
    pub fn request_options(&self) -> PublishOptions {
        match self {
            Self::PairingDelete => opts(DAYS, IrnTag::PairingDelete, false),
            Self::PairingPing => opts(30, IrnTag::PairingPing, false),
            Self::SessionPropose => opts(5 * MINUTES, IrnTag::SessionPropose, true),
            Self::SessionSettle => opts(5 * MINUTES, IrnTag::SessionSettle, false),
            Self::SessionUpdate => opts(DAYS, IrnTag::SessionUpdate, false),
            Self::SessionExtend => opts(DAYS, IrnTag::SessionExtend, false),
            Self::SessionRequest => opts(5 * MINUTES, IrnTag::SessionRequest, true),
            Self::SessionEvent => opts(5 * MINUTES, IrnTag::SessionEvent, true),
            Self::SessionDelete => opts(DAYS, IrnTag::SessionDelete, false),
            Self::SessionPing => opts(30, IrnTag::SessionPing, false),
            Self::SessionAuthenticate => {
                opts(HOURS, IrnTag::SessionAuthenticate, true)
            }
        }
    }

    pub fn response_options(&self) -> PublishOptions {
        match self {
            Self::PairingDelete => opts(DAYS, IrnTag::PairingDeleteResponse, false),
            Self::PairingPing => opts(30, IrnTag::PairingPingResponse, false),
            Self::SessionPropose => {
                opts(5 * MINUTES, IrnTag::SessionProposeApproveResponse, false)
            }
            Self::SessionSettle => {
                opts(5 * MINUTES, IrnTag::SessionSettleResponse, false)
            }
            Self::SessionUpdate => opts(DAYS, IrnTag::SessionUpdateResponse, false),
            Self::SessionExtend => opts(DAYS, IrnTag::SessionExtendResponse, false),
            Self::SessionRequest => {
                opts(5 * MINUTES, IrnTag::SessionRequestResponse, false)
            }
            Self::SessionEvent => {
                opts(5 * MINUTES, IrnTag::SessionEventResponse, false)
            }
            Self::SessionDelete => opts(DAYS, IrnTag::SessionDeleteResponse, false),
            Self::SessionPing => opts(30, IrnTag::SessionPingResponse, false),
            Self::SessionAuthenticate => {
                opts(HOURS, IrnTag::SessionAuthenticateApproveResponse, false)
            }
        }
    }

    /// Error responses use a dedicated tag for the two handshake methods
    pub fn reject_options(&self) -> PublishOptions {
        match self {
            Self::SessionPropose => {
                opts(5 * MINUTES, IrnTag::SessionProposeRejectResponse, false)
            }
            Self::SessionAuthenticate => {
                opts(HOURS, IrnTag::SessionAuthenticateRejectResponse, false)
            }
            other => other.response_options(),
        }
    }

    pub fn is_pairing_method(&self) -> bool {
        matches!(self, Self::PairingDelete | Self::PairingPing)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WcData {
    PairingPing,
    PairingDelete(ReasonParams),
    SessionPropose(SessionProposeParams),
    SessionSettle(SessionSettleParams),
    SessionUpdate(SessionUpdateParams),
    SessionExtend(SessionExtendParams),
    SessionRequest(SessionRequestParams),
    SessionEvent(SessionEventParams),
    SessionDelete(ReasonParams),
    SessionPing,
    SessionAuthenticate(SessionAuthenticateParams),

    Result(Value),
    Error(MessageError),
}

impl WcData {
    pub fn method(&self) -> Option<WcMethod> {
        match self {
            Self::PairingPing => Some(WcMethod::PairingPing),
            Self::PairingDelete(_) => Some(WcMethod::PairingDelete),
            Self::SessionPropose(_) => Some(WcMethod::SessionPropose),
            Self::SessionSettle(_) => Some(WcMethod::SessionSettle),
            Self::SessionUpdate(_) => Some(WcMethod::SessionUpdate),
            Self::SessionExtend(_) => Some(WcMethod::SessionExtend),
            Self::SessionRequest(_) => Some(WcMethod::SessionRequest),
            Self::SessionEvent(_) => Some(WcMethod::SessionEvent),
            Self::SessionDelete(_) => Some(WcMethod::SessionDelete),
            Self::SessionPing => Some(WcMethod::SessionPing),
            Self::SessionAuthenticate(_) => Some(WcMethod::SessionAuthenticate),

            Self::Result(_) | Self::Error(_) => None,
        }
    }

    pub fn params(&self) -> Result<Option<Value>> {
        Ok(match self {
            Self::PairingPing | Self::SessionPing => Some(json!({})),
            Self::PairingDelete(p) | Self::SessionDelete(p) => {
                Some(serde_json::to_value(p)?)
            }
            Self::SessionPropose(p) => Some(serde_json::to_value(p)?),
            Self::SessionSettle(p) => Some(serde_json::to_value(p)?),
            Self::SessionUpdate(p) => Some(serde_json::to_value(p)?),
            Self::SessionExtend(p) => Some(serde_json::to_value(p)?),
            Self::SessionRequest(p) => Some(serde_json::to_value(p)?),
            Self::SessionEvent(p) => Some(serde_json::to_value(p)?),
            Self::SessionAuthenticate(p) => Some(serde_json::to_value(p)?),

            Self::Result(_) | Self::Error(_) => None,
        })
    }

    fn from_params(method: WcMethod, params: Value) -> Result<Self> {
        Ok(match method {
            WcMethod::PairingPing => Self::PairingPing,
            WcMethod::SessionPing => Self::SessionPing,
            WcMethod::PairingDelete => Self::PairingDelete(serde_json::from_value(params)?),
            WcMethod::SessionDelete => Self::SessionDelete(serde_json::from_value(params)?),
            WcMethod::SessionPropose => Self::SessionPropose(serde_json::from_value(params)?),
            WcMethod::SessionSettle => Self::SessionSettle(serde_json::from_value(params)?),
            WcMethod::SessionUpdate => Self::SessionUpdate(serde_json::from_value(params)?),
            WcMethod::SessionExtend => Self::SessionExtend(serde_json::from_value(params)?),
            WcMethod::SessionRequest => Self::SessionRequest(serde_json::from_value(params)?),
            WcMethod::SessionEvent => Self::SessionEvent(serde_json::from_value(params)?),
            WcMethod::SessionAuthenticate => {
                Self::SessionAuthenticate(serde_json::from_value(params)?)
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WcMessage {
    pub id: u64,
    pub data: WcData,
}

impl Display for WcMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.method() {
            Some(method) => write!(f, "{method}#{}", self.id),
            None => write!(f, "response#{}", self.id),
        }
    }
}

impl WcMessage {
    /// New outbound request with a fresh payload id
    pub fn request(data: WcData) -> Self {
        Self {
            id: payload_id(),
            data,
        }
    }

    pub fn response(id: u64, result: Value) -> Self {
        Self {
            id,
            data: WcData::Result(result),
        }
    }

    pub fn error(id: u64, error: MessageError) -> Self {
        Self {
            id,
            data: WcData::Error(error),
        }
    }

    pub fn method(&self) -> Option<WcMethod> {
        self.data.method()
    }

    pub fn is_request(&self) -> bool {
        self.method().is_some()
    }

    pub fn into_raw(&self) -> Result<Message> {
        Ok(match &self.data {
            WcData::Result(v) => Message::response(self.id, v.clone()),
            WcData::Error(e) => Message::error_response(self.id, e.clone()),
            data => {
                let method = data
                    .method()
                    .ok_or_else(|| Error::Format("request without method".into()))?;
                Message::request(
                    self.id,
                    method.to_string(),
                    data.params()?.unwrap_or_else(|| json!({})),
                )
            }
        })
    }

    /// Outcome of a response message
    pub fn into_result(self) -> Result<Value> {
        match self.data {
            WcData::Result(v) => Ok(v),
            WcData::Error(e) => Err(Error::Network(e)),
            other => Err(Error::Format(format!(
                "expected a response, got {:?}",
                other.method()
            ))),
        }
    }

    pub fn as_result<R>(&self) -> Option<R>
    where
        R: DeserializeOwned,
    {
        match &self.data {
            WcData::Result(v) => serde_json::from_value::<R>(v.clone()).ok(),
            _ => None,
        }
    }
}

impl TryFrom<Message> for WcMessage {
    type Error = crate::Error;

    fn try_from(msg: Message) -> std::result::Result<Self, Self::Error> {
        let data = match &msg.method {
            Some(method) => {
                let method = WcMethod::from_str(method)?;
                WcData::from_params(method, msg.params.unwrap_or_else(|| json!({})))?
            }
            None => match msg.error {
                Some(error) => WcData::Error(error),
                None => WcData::Result(msg.result.unwrap_or_default()),
            },
        };

        Ok(WcMessage { id: msg.id, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SessionRequestObject, IrnTag};

    #[test]
    fn test_decode_session_request() {
        let raw: Message = serde_json::from_value(json!({
            "id": 1744207726123456u64,
            "jsonrpc": "2.0",
            "method": "wc_sessionRequest",
            "params": {
                "request": {
                    "method": "personal_sign",
                    "params": ["0x48656c6c6f", "0x0000000000000000000000000000000000000123"],
                    "expiryTimestamp": 1744208026
                },
                "chainId": "eip155:1"
            }
        }))
        .unwrap();

        let msg = WcMessage::try_from(raw.clone()).unwrap();
        assert_eq!(msg.method(), Some(WcMethod::SessionRequest));
        assert_eq!(
            msg.data,
            WcData::SessionRequest(SessionRequestParams {
                request: SessionRequestObject {
                    method: "personal_sign".into(),
                    params: json!([
                        "0x48656c6c6f",
                        "0x0000000000000000000000000000000000000123"
                    ]),
                    expiry_timestamp: Some(1744208026),
                },
                chain_id: "eip155:1".into(),
            })
        );
        assert_eq!(msg.into_raw().unwrap(), raw);
    }

    #[test]
    fn test_decode_ping_and_responses() {
        let ping = WcMessage::try_from(Message::request(5, "wc_sessionPing", json!({})))
            .unwrap();
        assert_eq!(ping.data, WcData::SessionPing);

        let ok = WcMessage::try_from(Message::response(5, json!(true))).unwrap();
        assert!(!ok.is_request());
        assert_eq!(ok.as_result::<bool>(), Some(true));

        let err = WcMessage::try_from(Message::error_response(
            5,
            MessageError::new(5000, "User rejected."),
        ))
        .unwrap();
        assert!(matches!(err.into_result(), Err(Error::Network(_))));
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let raw = Message::request(1, "wc_unknown", json!({}));
        assert!(matches!(WcMessage::try_from(raw), Err(Error::Format(_))));
    }

    #[test]
    fn test_publish_options_table() {
        let request = WcMethod::SessionRequest.request_options();
        assert_eq!(request.tag, IrnTag::SessionRequest);
        assert_eq!(request.ttl, 300);
        assert!(request.prompt);

        assert_eq!(
            WcMethod::SessionPropose.reject_options().tag,
            IrnTag::SessionProposeRejectResponse
        );
        assert_eq!(
            WcMethod::SessionPing.reject_options().tag,
            IrnTag::SessionPingResponse
        );
        assert_eq!(WcMethod::PairingDelete.response_options().ttl, 86400);
    }
}
