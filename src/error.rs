use std::fmt;

use crate::message::MessageError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No key pair or sym key is registered under this public key / topic
    KeyNotFound(String),
    /// Authentication tag mismatch: wrong key or tampered envelope
    DecryptFailed,
    InvalidEnvelope(String),
    KeyDerivation,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::KeyNotFound(k) => write!(f, "no key found for {k}"),
            CryptoError::DecryptFailed => write!(f, "envelope decryption failed"),
            CryptoError::InvalidEnvelope(e) => write!(f, "invalid envelope: {e}"),
            CryptoError::KeyDerivation => write!(f, "key derivation failed"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Crypto(CryptoError),
    Transport(String),
    /// Peer or relay answered with a JSON-RPC error object
    Network(MessageError),
    Timeout,
    Format(String),
    NamespaceMismatch(String),
    MethodNotAllowed { method: String, chain_id: String },
    NotInitialized(&'static str),
    SessionNotFound(String),
    NotFound(String),
    ConnectionClosed,
    Cancelled,
    Rejected { code: i64, message: String },
    Unauthorized(String),
    Json(serde_json::Error),
    FromHex(alloy::hex::FromHexError),
    Storage(anyhow::Error),
    Signature(alloy::primitives::SignatureError),
    Time(time::error::Format),
}

impl Error {
    /// Errors worth another publish attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout | Error::ConnectionClosed
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Crypto(e) => write!(f, "crypto error: {e}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Network(e) => write!(
                f,
                "json-rpc error {}: {}",
                e.code.unwrap_or_default(),
                e.message.as_deref().unwrap_or_default()
            ),
            Error::Timeout => write!(f, "request timed out"),
            Error::Format(e) => write!(f, "malformed input: {e}"),
            Error::NamespaceMismatch(e) => write!(f, "namespace mismatch: {e}"),
            Error::MethodNotAllowed { method, chain_id } => {
                write!(f, "method {method} not allowed on {chain_id}")
            }
            Error::NotInitialized(what) => write!(f, "{what} not initialized"),
            Error::SessionNotFound(topic) => {
                write!(f, "no session for topic {topic}")
            }
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Cancelled => write!(f, "request cancelled"),
            Error::Rejected { code, message } => {
                write!(f, "rejected by peer ({code}): {message}")
            }
            Error::Unauthorized(e) => write!(f, "unauthorized: {e}"),
            Error::Json(e) => write!(f, "json error: {e}"),
            Error::FromHex(e) => write!(f, "hex error: {e}"),
            Error::Storage(e) => write!(f, "storage error: {e}"),
            Error::Signature(e) => write!(f, "signature error: {e}"),
            Error::Time(e) => write!(f, "time format error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<MessageError> for Error {
    fn from(e: MessageError) -> Self {
        Error::Network(e)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Storage(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<alloy::hex::FromHexError> for Error {
    fn from(e: alloy::hex::FromHexError) -> Self {
        Error::FromHex(e)
    }
}

impl From<alloy::primitives::SignatureError> for Error {
    fn from(e: alloy::primitives::SignatureError) -> Self {
        Error::Signature(e)
    }
}

impl From<time::error::Format> for Error {
    fn from(e: time::error::Format) -> Self {
        Error::Time(e)
    }
}

impl From<serde_plain::Error> for Error {
    fn from(e: serde_plain::Error) -> Self {
        Error::Format(e.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::Format(e.to_string())
    }
}

impl From<base64ct::Error> for Error {
    fn from(e: base64ct::Error) -> Self {
        Error::Crypto(CryptoError::InvalidEnvelope(e.to_string()))
    }
}
