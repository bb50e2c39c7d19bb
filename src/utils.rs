use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::hex;
use base64ct::{Base64, Encoding};
use hkdf::Hkdf;
use rand::{Rng, RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use url::form_urlencoded;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    constants::{
        DID_DELIMITER, DID_METHOD, DID_PREFIX, MULTICODEC_ED25519_BASE,
        MULTICODEC_ED25519_HEADER,
    },
    error::{CryptoError, Error, Result},
};

#[derive(Debug, Clone, PartialEq)]
pub struct UriParameters {
    pub topic: String,
    pub version: u32,
    pub sym_key: [u8; 32],
    pub relay: RelayProtocolOptions,
    pub methods: Option<Vec<String>>,
    pub expiry_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    pub data: Option<String>,
}

impl TryFrom<&str> for UriParameters {
    type Error = Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        parse_uri(value)
    }
}

/// Parses `wc:<topic>@<version>?relay-protocol=<p>&symKey=<hex>[&...]`.
/// Base64 wrapped URIs are unwrapped first.
pub fn parse_uri(input: &str) -> Result<UriParameters> {
    let mut input = input.trim().to_string();
    if !input.starts_with("wc:") {
        if let Ok(decoded_bytes) = Base64::decode_vec(&input) {
            if let Ok(decoded_str) = String::from_utf8(decoded_bytes) {
                if decoded_str.starts_with("wc:") {
                    input = decoded_str;
                }
            }
        }
    }

    let rest = input
        .strip_prefix("wc://")
        .or_else(|| input.strip_prefix("wc:"))
        .ok_or_else(|| Error::Format("uri must use the wc: scheme".into()))?;

    let (path, query_string) = rest
        .split_once('?')
        .ok_or_else(|| Error::Format("uri has no query".into()))?;

    let (topic, version) = path
        .split_once('@')
        .ok_or_else(|| Error::Format("uri has no version".into()))?;

    if topic.len() != 64 || hex::decode(topic).is_err() {
        return Err(Error::Format(format!("invalid topic {topic}")));
    }

    let mut query_params: HashMap<String, String> = HashMap::new();
    for (key, value) in form_urlencoded::parse(query_string.as_bytes()) {
        query_params.insert(key.into(), value.into());
    }

    let sym_key = query_params
        .get("symKey")
        .ok_or_else(|| Error::Format("symKey not mentioned".into()))?;
    let sym_key = hex::decode_to_array::<_, 32>(sym_key)
        .map_err(|e| Error::Format(format!("invalid symKey: {e}")))?;

    let methods = query_params
        .get("methods")
        .filter(|m| !m.is_empty())
        .map(|m| m.split(',').map(|s| s.to_string()).collect());

    Ok(UriParameters {
        topic: topic.to_string(),
        version: version.parse()?,
        sym_key,
        relay: parse_relay_params(&query_params)?,
        methods,
        expiry_timestamp: query_params
            .get("expiryTimestamp")
            .and_then(|v| v.parse().ok()),
    })
}

pub fn parse_relay_params(
    params: &HashMap<String, String>,
) -> Result<RelayProtocolOptions> {
    let protocol = params
        .get("relay-protocol")
        .ok_or_else(|| Error::Format("relay-protocol not mentioned".into()))?
        .clone();
    let data = params.get("relay-data").cloned();

    Ok(RelayProtocolOptions { protocol, data })
}

pub fn format_uri(params: &UriParameters) -> String {
    let mut uri = format!(
        "wc:{}@{}?relay-protocol={}&symKey={}",
        params.topic,
        params.version,
        params.relay.protocol,
        hex::encode(params.sym_key)
    );
    if let Some(data) = &params.relay.data {
        uri.push_str("&relay-data=");
        uri.push_str(data);
    }
    if let Some(expiry) = params.expiry_timestamp {
        uri.push_str(&format!("&expiryTimestamp={expiry}"));
    }
    if let Some(methods) = &params.methods {
        uri.push_str("&methods=");
        uri.push_str(&methods.join(","));
    }
    uri
}

static LAST_PAYLOAD_ID: AtomicU64 = AtomicU64::new(0);

/// Millisecond timestamp with three random digits, forced strictly
/// increasing within the process so an id is never handed out twice.
pub fn payload_id() -> u64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let candidate = now_ms * 1000 + rand::thread_rng().gen_range(0..1000);

    let prev = match LAST_PAYLOAD_ID.fetch_update(
        Ordering::SeqCst,
        Ordering::SeqCst,
        |last| Some(candidate.max(last + 1)),
    ) {
        Ok(prev) | Err(prev) => prev,
    };
    candidate.max(prev + 1)
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn random_bytes32() -> [u8; 32] {
    let mut random_value = [0u8; 32];
    OsRng.fill_bytes(&mut random_value);
    random_value
}

pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Sha256::digest(data.as_ref()).into()
}

/// Topic of a sym key (or of a public key, for auth response topics)
pub fn hash_key(key: &[u8; 32]) -> String {
    hex::encode(sha256(key))
}

pub fn x25519_public_key(private_key: [u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(private_key);
    PublicKey::from(&secret).to_bytes()
}

/// X25519 followed by HKDF-SHA256 with empty salt and info
pub fn derive_sym_key(
    private_key: [u8; 32],
    peer_public_key: [u8; 32],
) -> Result<[u8; 32]> {
    let secret = StaticSecret::from(private_key);
    let shared = secret.diffie_hellman(&PublicKey::from(peer_public_key));

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut sym_key = [0u8; 32];
    hk.expand(&[], &mut sym_key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(sym_key)
}

pub fn decode_key(key: &str) -> Result<[u8; 32]> {
    Ok(hex::decode_to_array::<_, 32>(key)?)
}

pub fn encode_iss(public_key: &[u8; 32]) -> String {
    let bytes = [&MULTICODEC_ED25519_HEADER[..], &public_key[..]].concat();
    let multicodec = format!(
        "{}{}",
        MULTICODEC_ED25519_BASE,
        bs58::encode(bytes).into_string()
    );
    [DID_PREFIX, DID_METHOD, &multicodec].join(DID_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "wc:b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee@2?relay-protocol=irn&symKey=761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2&expiryTimestamp=1742817708&methods=wc_sessionAuthenticate";

    #[test]
    fn test_parse_uri() {
        let result = parse_uri(URI).unwrap();
        assert_eq!(
            result,
            UriParameters {
                topic: "b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee"
                    .to_string(),
                version: 2,
                sym_key: hex::decode_to_array(
                    "761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2"
                )
                .unwrap(),
                relay: RelayProtocolOptions {
                    protocol: "irn".to_string(),
                    data: None,
                },
                methods: Some(vec!["wc_sessionAuthenticate".to_string()]),
                expiry_timestamp: Some(1742817708)
            }
        );
    }

    #[test]
    fn test_format_then_parse() {
        let params = parse_uri(URI).unwrap();
        assert_eq!(format_uri(&params), URI);

        let minimal = UriParameters {
            methods: None,
            expiry_timestamp: None,
            ..params
        };
        assert_eq!(parse_uri(&format_uri(&minimal)).unwrap(), minimal);
    }

    #[test]
    fn test_parse_base64_wrapped_uri() {
        let wrapped = Base64::encode_string(URI.as_bytes());
        assert_eq!(parse_uri(&wrapped).unwrap(), parse_uri(URI).unwrap());
    }

    #[test]
    fn test_malformed_uris() {
        let missing_sym_key = "wc:b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee@2?relay-protocol=irn";
        assert!(matches!(parse_uri(missing_sym_key), Err(Error::Format(_))));

        let wrong_scheme = URI.replacen("wc:", "wx:", 1);
        assert!(matches!(parse_uri(&wrong_scheme), Err(Error::Format(_))));

        let missing_relay = "wc:b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee@2?symKey=761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2";
        assert!(matches!(parse_uri(missing_relay), Err(Error::Format(_))));

        assert!(matches!(parse_uri("wc:abc@2?relay-protocol=irn"), Err(Error::Format(_))));
    }

    #[test]
    fn test_payload_id_is_strictly_increasing() {
        let mut last = payload_id();
        for _ in 0..1000 {
            let next = payload_id();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_derive_sym_key_is_symmetric() {
        let a = random_bytes32();
        let b = random_bytes32();
        assert_eq!(
            derive_sym_key(a, x25519_public_key(b)).unwrap(),
            derive_sym_key(b, x25519_public_key(a)).unwrap()
        );
    }
}
