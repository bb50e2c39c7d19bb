/// Relay Auth
///
/// Utils to sign JWT for authorizing with Relay RPC
///
use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

use crate::{
    constants::{JWT_DELIMITER, JWT_IRIDIUM_ALG, JWT_IRIDIUM_TYP},
    error::Result,
    utils::{encode_iss, random_bytes32},
};

// Only used for JWT signing, not used for encryption
#[derive(Debug, Clone)]
pub struct Keypair {
    pub seed: [u8; 32],
    pub public_key: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair::from_seed(random_bytes32())
    }

    // https://github.com/WalletConnect/walletconnect-utils/blob/4d8eb66bcea89857c630017774845e872a66922a/relay/relay-auth/src/api.ts#L14
    pub fn from_seed(seed: [u8; 32]) -> Keypair {
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();
        Keypair { seed, public_key }
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.seed).sign(data).to_bytes()
    }

    /// `did:key` identifier the relay knows this client by
    pub fn client_id(&self) -> String {
        encode_iss(&self.public_key)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IridiumJWTHeader {
    pub alg: String,
    pub typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IridiumJWTPayload {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

fn encode_json<T: ?Sized + Serialize>(val: &T) -> Result<String> {
    Ok(Base64UrlUnpadded::encode_string(
        serde_json::to_string(val)?.as_bytes(),
    ))
}

pub fn sign_jwt(
    sub: &str,
    aud: &str,
    ttl: u64,
    keypair: &Keypair,
    iat: u64,
) -> Result<String> {
    let header = IridiumJWTHeader {
        alg: JWT_IRIDIUM_ALG.to_string(),
        typ: JWT_IRIDIUM_TYP.to_string(),
    };
    let payload = IridiumJWTPayload {
        iss: keypair.client_id(),
        sub: sub.to_string(),
        aud: aud.to_string(),
        iat,
        exp: iat + ttl,
    };

    let data = [encode_json(&header)?, encode_json(&payload)?]
        .join(JWT_DELIMITER);
    let signature = keypair.sign(data.as_bytes());
    let sig_encoded = Base64UrlUnpadded::encode_string(&signature);

    Ok([data, sig_encoded].join(JWT_DELIMITER))
}

#[cfg(test)]
mod test {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    use super::*;

    #[test]
    fn test_client_id() {
        let kp = Keypair::from_seed([0; 32]);
        assert_eq!(
            kp.client_id(),
            "did:key:z6MkiTBz1ymuepAQ4HEHYSF1H8quG5GLVVQR3djdX3mDooWp"
        );
    }

    #[test]
    fn test_jwt_is_verifiable() {
        let kp = Keypair::generate();
        let jwt =
            sign_jwt("sub", "wss://relay.walletconnect.org", 86400, &kp, 1000)
                .unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let payload: IridiumJWTPayload = serde_json::from_slice(
            &Base64UrlUnpadded::decode_vec(parts[1]).unwrap(),
        )
        .unwrap();
        assert_eq!(payload.iss, kp.client_id());
        assert_eq!(payload.aud, "wss://relay.walletconnect.org");
        assert_eq!(payload.exp, 1000 + 86400);

        let signature: [u8; 64] = Base64UrlUnpadded::decode_vec(parts[2])
            .unwrap()
            .try_into()
            .unwrap();
        VerifyingKey::from_bytes(&kp.public_key)
            .unwrap()
            .verify(
                format!("{}.{}", parts[0], parts[1]).as_bytes(),
                &Signature::from_bytes(&signature),
            )
            .unwrap();
    }
}
