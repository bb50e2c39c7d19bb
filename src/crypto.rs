/// Crypto
///
/// Keychain (x25519 key pairs and sym keys) and the encrypted envelope used
/// for every payload published to the relay.
///
/// Envelope layout, base64 encoded:
/// - type 0: `[0][iv 12B][ciphertext+tag]`
/// - type 1: `[1][sender public key 32B][iv 12B][ciphertext+tag]`
///
use std::collections::HashMap;
use std::sync::Arc;

use alloy::hex;
use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use log::debug;
use rand::{RngCore, rngs::OsRng};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;

use crate::constants::{CRYPTO_CLIENT_SEED, CRYPTO_JWT_TTL, KEYCHAIN_STORAGE_KEY};
use crate::error::{CryptoError, Error, Result};
use crate::relay_auth::{Keypair, sign_jwt};
use crate::storage::{KeyValueStorage, get_typed, set_typed};
use crate::utils::{
    decode_key, derive_sym_key, hash_key, random_bytes32, unix_timestamp,
    x25519_public_key,
};

pub const IV_LENGTH: usize = 12;
pub const KEY_LENGTH: usize = 32;
pub const TYPE_LENGTH: usize = 1;
pub const TYPE_0: u8 = 0;
pub const TYPE_1: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    pub type_byte: u8,
    pub sender_public_key: Option<String>,
    pub receiver_public_key: Option<String>,
}

impl EncodeOptions {
    pub fn type_1(sender_public_key: String, receiver_public_key: String) -> Self {
        Self {
            type_byte: TYPE_1,
            sender_public_key: Some(sender_public_key),
            receiver_public_key: Some(receiver_public_key),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Our own public key, needed to open type 1 envelopes
    pub receiver_public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedEnvelope {
    pub type_byte: u8,
    pub sealed: Vec<u8>,
    pub iv: [u8; IV_LENGTH],
    // only for type 1 message - helps the peer calculate the diffie sym key
    pub sender_public_key: Option<[u8; KEY_LENGTH]>,
}

#[derive(Debug, Clone)]
pub enum EncodingType {
    Base64,
    Base64Url,
}

impl EncryptedEnvelope {
    pub fn serialize(&self, encoding: EncodingType) -> Result<String> {
        let mut bytes = vec![self.type_byte];

        match self.type_byte {
            TYPE_0 => {}
            TYPE_1 => {
                let sender = self.sender_public_key.ok_or_else(|| {
                    CryptoError::InvalidEnvelope(
                        "missing sender public key for type 1 envelope".into(),
                    )
                })?;
                bytes.extend_from_slice(&sender);
            }
            other => {
                return Err(CryptoError::InvalidEnvelope(format!(
                    "unsupported envelope type {other}"
                ))
                .into());
            }
        }
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.sealed);

        Ok(match encoding {
            EncodingType::Base64 => Base64::encode_string(&bytes),
            EncodingType::Base64Url => Base64UrlUnpadded::encode_string(&bytes),
        })
    }

    pub fn deserialize(encoded: &str, encoding: EncodingType) -> Result<Self> {
        let bytes = match encoding {
            EncodingType::Base64 => Base64::decode_vec(encoded)?,
            EncodingType::Base64Url => Base64UrlUnpadded::decode_vec(encoded)?,
        };

        let type_byte = *bytes
            .first()
            .ok_or_else(|| CryptoError::InvalidEnvelope("empty envelope".into()))?;

        let (sender_public_key, rest) = match type_byte {
            TYPE_0 => (None, &bytes[TYPE_LENGTH..]),
            TYPE_1 => {
                if bytes.len() < TYPE_LENGTH + KEY_LENGTH {
                    return Err(CryptoError::InvalidEnvelope(
                        "type 1 envelope too short".into(),
                    )
                    .into());
                }
                let mut sender = [0u8; KEY_LENGTH];
                sender.copy_from_slice(&bytes[TYPE_LENGTH..TYPE_LENGTH + KEY_LENGTH]);
                (Some(sender), &bytes[TYPE_LENGTH + KEY_LENGTH..])
            }
            other => {
                return Err(CryptoError::InvalidEnvelope(format!(
                    "unsupported envelope type {other}"
                ))
                .into());
            }
        };

        if rest.len() < IV_LENGTH {
            return Err(CryptoError::InvalidEnvelope("envelope too short".into()).into());
        }
        let mut iv = [0u8; IV_LENGTH];
        iv.copy_from_slice(&rest[..IV_LENGTH]);

        Ok(EncryptedEnvelope {
            type_byte,
            sealed: rest[IV_LENGTH..].to_vec(),
            iv,
            sender_public_key,
        })
    }
}

pub struct Crypto {
    storage: Arc<dyn KeyValueStorage>,
    keychain: RwLock<Option<HashMap<String, String>>>,
}

impl Crypto {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            keychain: RwLock::new(None),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let mut keychain = self.keychain.write().await;
        if keychain.is_none() {
            let restored: HashMap<String, String> =
                get_typed(self.storage.as_ref(), KEYCHAIN_STORAGE_KEY)
                    .await?
                    .unwrap_or_default();
            *keychain = Some(restored);
        }
        Ok(())
    }

    async fn get_key(&self, tag: &str) -> Result<Option<String>> {
        let keychain = self.keychain.read().await;
        let keychain = keychain.as_ref().ok_or(Error::NotInitialized("crypto"))?;
        Ok(keychain.get(tag).cloned())
    }

    async fn set_key(&self, tag: &str, value: String) -> Result<()> {
        let mut keychain = self.keychain.write().await;
        let keychain = keychain.as_mut().ok_or(Error::NotInitialized("crypto"))?;
        keychain.insert(tag.to_string(), value);
        set_typed(self.storage.as_ref(), KEYCHAIN_STORAGE_KEY, keychain).await
    }

    async fn del_key(&self, tag: &str) -> Result<()> {
        let mut keychain = self.keychain.write().await;
        let keychain = keychain.as_mut().ok_or(Error::NotInitialized("crypto"))?;
        if keychain.remove(tag).is_some() {
            set_typed(self.storage.as_ref(), KEYCHAIN_STORAGE_KEY, keychain).await?;
        }
        Ok(())
    }

    pub async fn has_keys(&self, tag: &str) -> Result<bool> {
        Ok(self.get_key(tag).await?.is_some())
    }

    /// Returns the hex public key; the private key stays in the keychain.
    pub async fn generate_key_pair(&self) -> Result<String> {
        let private_key = random_bytes32();
        let public_key = hex::encode(x25519_public_key(private_key));
        self.set_key(&public_key, hex::encode(private_key)).await?;
        Ok(public_key)
    }

    async fn private_key(&self, public_key: &str) -> Result<[u8; 32]> {
        let private_key = self
            .get_key(public_key)
            .await?
            .ok_or_else(|| CryptoError::KeyNotFound(public_key.to_string()))?;
        decode_key(&private_key)
    }

    /// Derives the shared sym key and stores it under `sha256(sym_key)` (or
    /// `override_topic`). Deterministic for a given pair of keys.
    pub async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<&str>,
    ) -> Result<String> {
        let private_key = self.private_key(self_public_key).await?;
        let sym_key = derive_sym_key(private_key, decode_key(peer_public_key)?)?;
        self.set_sym_key(sym_key, override_topic).await
    }

    pub async fn set_sym_key(
        &self,
        sym_key: [u8; 32],
        override_topic: Option<&str>,
    ) -> Result<String> {
        let topic = override_topic
            .map(|t| t.to_string())
            .unwrap_or_else(|| hash_key(&sym_key));
        self.set_key(&topic, hex::encode(sym_key)).await?;
        Ok(topic)
    }

    async fn sym_key(&self, topic: &str) -> Result<[u8; 32]> {
        let sym_key = self
            .get_key(topic)
            .await?
            .ok_or_else(|| CryptoError::KeyNotFound(topic.to_string()))?;
        decode_key(&sym_key)
    }

    pub async fn delete_key_pair(&self, public_key: &str) -> Result<()> {
        self.del_key(public_key).await
    }

    pub async fn delete_sym_key(&self, topic: &str) -> Result<()> {
        self.del_key(topic).await
    }

    async fn client_keypair(&self) -> Result<Keypair> {
        let seed = match self.get_key(CRYPTO_CLIENT_SEED).await? {
            Some(seed) => decode_key(&seed)?,
            None => {
                let seed = random_bytes32();
                self.set_key(CRYPTO_CLIENT_SEED, hex::encode(seed)).await?;
                seed
            }
        };
        Ok(Keypair::from_seed(seed))
    }

    pub async fn get_client_id(&self) -> Result<String> {
        Ok(self.client_keypair().await?.client_id())
    }

    // https://github.com/WalletConnect/walletconnect-monorepo/blob/b39a5d4e62f5517ef47a70b5b93f27585b7132e8/packages/core/src/controllers/crypto.ts#L73
    pub async fn sign_jwt(&self, aud: &str) -> Result<String> {
        let keypair = self.client_keypair().await?;
        let sub = hex::encode(random_bytes32());
        sign_jwt(&sub, aud, CRYPTO_JWT_TTL, &keypair, unix_timestamp())
    }

    pub async fn encode<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        opts: EncodeOptions,
    ) -> Result<String> {
        let (sym_key, sender_public_key) = if opts.type_byte == TYPE_1 {
            let (Some(sender), Some(receiver)) =
                (&opts.sender_public_key, &opts.receiver_public_key)
            else {
                return Err(CryptoError::KeyNotFound(
                    "type 1 envelope needs sender and receiver public keys".into(),
                )
                .into());
            };
            let derived_topic = self.generate_shared_key(sender, receiver, None).await?;
            (self.sym_key(&derived_topic).await?, Some(decode_key(sender)?))
        } else {
            (self.sym_key(topic).await?, None)
        };

        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let message = serde_json::to_string(payload)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&sym_key));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), message.as_bytes())
            .map_err(|_| CryptoError::InvalidEnvelope("encryption failed".into()))?;

        EncryptedEnvelope {
            type_byte: opts.type_byte,
            sealed,
            iv,
            sender_public_key,
        }
        .serialize(EncodingType::Base64)
    }

    pub async fn decode<T: DeserializeOwned>(
        &self,
        topic: &str,
        encoded: &str,
        opts: DecodeOptions,
    ) -> Result<T> {
        let envelope = EncryptedEnvelope::deserialize(encoded, EncodingType::Base64)?;

        let sym_key = match envelope.sender_public_key {
            Some(sender) => {
                let receiver = opts.receiver_public_key.ok_or_else(|| {
                    CryptoError::KeyNotFound(format!("receiver key for {topic}"))
                })?;
                let derived_topic = self
                    .generate_shared_key(&receiver, &hex::encode(sender), None)
                    .await?;
                self.sym_key(&derived_topic).await?
            }
            None => self.sym_key(topic).await?,
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&sym_key));
        let decrypted = cipher
            .decrypt(Nonce::from_slice(&envelope.iv), envelope.sealed.as_ref())
            .map_err(|_| CryptoError::DecryptFailed)?;
        debug!("decoded {} bytes on {topic}", decrypted.len());

        Ok(serde_json::from_slice(&decrypted)?)
    }

    pub fn envelope_type(encoded: &str) -> Result<u8> {
        Ok(EncryptedEnvelope::deserialize(encoded, EncodingType::Base64)?.type_byte)
    }
}
