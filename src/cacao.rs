/// Cacao
///
/// CAIP-74 capability objects returned by `wc_sessionAuthenticate`. The
/// wallet builds one per chain from the request payload, signs the CAIP-122
/// message with EIP-191 and the dApp recovers the signer to verify it.
///
use alloy::hex;
use alloy::primitives::Address;
use alloy::signers::Signature;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::AuthPayload;

use std::fmt::Display;
use std::str::FromStr;

pub const CACAO_HEADER_TYPE: &str = "caip122";
pub const CACAO_SIGNATURE_TYPE: &str = "eip191";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cacao {
    #[serde(rename = "h")]
    pub header: CacaoHeader,
    #[serde(rename = "p")]
    pub payload: CacaoPayload,
    #[serde(rename = "s")]
    pub signature: Option<CacaoSignature>,
}

impl Cacao {
    /// Unsigned cacao answering `auth` for one account on `chain_id`
    /// (a CAIP-2 id such as `eip155:1`).
    pub fn from_auth_request(
        auth: &AuthPayload,
        account_address: Address,
        chain_id: &str,
    ) -> Result<Self> {
        let reference = match chain_id.split_once(':') {
            Some(("eip155", reference)) if !reference.is_empty() => reference,
            _ => {
                return Err(Error::Format(format!(
                    "cacao needs an eip155 chain, got {chain_id}"
                )));
            }
        };

        Ok(Cacao {
            header: CacaoHeader {
                header_type: CACAO_HEADER_TYPE.to_string(),
            },
            payload: CacaoPayload {
                domain: auth.domain.clone(),
                uri: auth.aud.clone(),
                version: auth.version.clone(),
                statement: auth.statement.clone(),
                nonce: Some(auth.nonce.clone()),
                issued_at: Some(auth.iat.clone()),
                expiration_time: auth.exp.clone(),
                not_before: auth.nbf.clone(),
                request_id: auth.request_id.clone(),
                resources: auth.resources.clone(),
                iss: DID {
                    chain_id: reference.to_string(),
                    account_address,
                },
            },
            signature: None,
        })
    }

    pub fn insert_signature(&mut self, signature: Signature) {
        self.signature = Some(CacaoSignature {
            signature_type: CACAO_SIGNATURE_TYPE.to_string(),
            signature: hex::encode_prefixed(signature.as_bytes()),
        });
    }

    pub fn verify(&self) -> Result<()> {
        let message = self.payload.caip122_message();
        let Some(signature) = &self.signature else {
            return Err(Error::Unauthorized(
                "cannot verify, signature is missing".to_string(),
            ));
        };
        if signature.signature_type != CACAO_SIGNATURE_TYPE {
            return Err(Error::Unauthorized(format!(
                "unsupported signature type {}",
                signature.signature_type
            )));
        }

        let address = signature
            .into_alloy_signature()?
            .recover_address_from_msg(message)?;
        if address == self.payload.iss.account_address {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "signature does not match the address: {address}"
            )))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacaoHeader {
    #[serde(rename = "t")]
    pub header_type: String, // "caip122"
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacaoPayload {
    pub domain: String,
    #[serde(rename = "aud")]
    pub uri: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(rename = "iat")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
    #[serde(rename = "exp")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<String>,
    #[serde(rename = "nbf")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(rename = "requestId")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    pub iss: DID,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacaoSignature {
    #[serde(rename = "t")]
    pub signature_type: String, // "eip191"
    #[serde(rename = "s")]
    pub signature: String,
}

impl CacaoSignature {
    pub fn into_alloy_signature(&self) -> Result<Signature> {
        Ok(Signature::from_str(&self.signature)?)
    }
}

impl CacaoPayload {
    /// CAIP-122 sign-in text, the exact bytes the wallet signs.
    pub fn caip122_message(&self) -> String {
        let mut lines = vec![
            format!(
                "{} wants you to sign in with your Ethereum account:",
                self.domain
            ),
            self.iss.account_address.to_string(),
            String::new(),
        ];
        if let Some(statement) = &self.statement {
            lines.push(statement.clone());
            lines.push(String::new());
        }
        lines.push(format!("URI: {}", self.uri));
        lines.push(format!("Version: {}", self.version));
        lines.push(format!("Chain ID: {}", self.iss.chain_id));

        let optional = [
            ("Nonce", &self.nonce),
            ("Issued At", &self.issued_at),
            ("Expiration Time", &self.expiration_time),
            ("Not Before", &self.not_before),
            ("Request ID", &self.request_id),
        ];
        for (label, value) in optional {
            if let Some(value) = value {
                lines.push(format!("{label}: {value}"));
            }
        }
        if !self.resources.is_empty() {
            lines.push("Resources:".to_string());
            lines.extend(self.resources.iter().map(|r| format!("- {r}")));
        }

        lines.join("\n")
    }
}

/// `did:pkh:eip155:<reference>:<address>`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DID {
    pub chain_id: String,
    pub account_address: Address,
}

impl Display for DID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "did:pkh:eip155:{}:{}", self.chain_id, self.account_address)
    }
}

impl FromStr for DID {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("did:pkh:eip155:")
            .ok_or_else(|| Error::Format(format!("not an eip155 did:pkh: {s}")))?;
        let (chain_id, address) = rest
            .split_once(':')
            .filter(|(chain, address)| !chain.is_empty() && !address.contains(':'))
            .ok_or_else(|| Error::Format(format!("malformed did:pkh: {s}")))?;
        let account_address = Address::from_str(address)
            .map_err(|e| Error::Format(format!("bad address in {s}: {e}")))?;
        Ok(DID {
            chain_id: chain_id.to_string(),
            account_address,
        })
    }
}

impl TryFrom<String> for DID {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DID> for String {
    fn from(did: DID) -> Self {
        did.to_string()
    }
}
