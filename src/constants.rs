pub const JWT_IRIDIUM_ALG: &str = "EdDSA";
pub const JWT_IRIDIUM_TYP: &str = "JWT";
pub const JWT_DELIMITER: &str = ".";

pub const DID_DELIMITER: &str = ":";
pub const DID_PREFIX: &str = "did";
pub const DID_METHOD: &str = "key";

pub const MULTICODEC_ED25519_BASE: &str = "z";
pub const MULTICODEC_ED25519_HEADER: [u8; 2] = [0xed, 0x01];

// https://github.com/WalletConnect/walletconnect-monorepo/blob/b39a5d4e62f5517ef47a70b5b93f27585b7132e8/packages/core/src/controllers/crypto.ts
pub const CRYPTO_CLIENT_SEED: &str = "client_ed25519_seed";
pub const CRYPTO_JWT_TTL: u64 = 86400; // ONE_DAY

pub const MINUTES: u64 = 60;
pub const HOURS: u64 = 60 * MINUTES;
pub const DAYS: u64 = 24 * HOURS;

pub const RELAY_DEFAULT_URL: &str = "wss://relay.walletconnect.org";
pub const RELAY_DEFAULT_PROTOCOL: &str = "irn";
pub const RELAYER_SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const RELAYER_PROTOCOL: &str = "wc";
pub const RELAYER_PROTOCOL_VERSION: u32 = 2;
// longest ttl any sign or pairing message is published with
pub const RELAY_MESSAGE_MAX_TTL: u64 = DAYS;

pub const PAIRING_URI_VERSION: u32 = 2;
pub const PAIRING_INACTIVE_TTL: u64 = 5 * MINUTES;
pub const PAIRING_ACTIVE_TTL: u64 = 30 * DAYS;

pub const PROPOSAL_TTL: u64 = 5 * MINUTES;
pub const SESSION_TTL: u64 = 7 * DAYS;
pub const SESSION_REQUEST_TTL: u64 = 5 * MINUTES;
pub const AUTH_REQUEST_TTL: u64 = HOURS;

pub const USER_DISCONNECTED_CODE: i64 = 6000;
pub const USER_DISCONNECTED_MESSAGE: &str = "User disconnected.";
pub const USER_REJECTED_CODE: i64 = 5000;
pub const UNSUPPORTED_NAMESPACE_CODE: i64 = 5104;
pub const UNAUTHORIZED_METHOD_CODE: i64 = 3001;
pub const UNAUTHORIZED_EVENT_CODE: i64 = 3002;
pub const UNAUTHORIZED_UPDATE_CODE: i64 = 3003;
pub const UNAUTHORIZED_EXTEND_CODE: i64 = 3004;
pub const NO_MATCHING_KEY_CODE: i64 = 2;

pub const EXPIRER_TARGET_TOPIC: &str = "topic";
pub const EXPIRER_TARGET_ID: &str = "id";

pub const KEYCHAIN_STORAGE_KEY: &str = "wc@2:core:0.3:keychain";
pub const EXPIRER_STORAGE_KEY: &str = "wc@2:core:0.3:expirer";
pub const SUBSCRIBER_STORAGE_KEY: &str = "wc@2:core:0.3:subscription";
pub const PAIRING_STORAGE_KEY: &str = "wc@2:core:0.3:pairing";
pub const SESSION_STORAGE_KEY: &str = "wc@2:client:0.3:session";
pub const PROPOSAL_STORAGE_KEY: &str = "wc@2:client:0.3:proposal";
pub const REQUEST_STORAGE_KEY: &str = "wc@2:client:0.3:request";
pub const AUTH_REQUEST_STORAGE_KEY: &str = "wc@2:client:0.3:authRequest";
pub const AUTH_KEY_STORAGE_KEY: &str = "wc@2:client:0.3:authKey";
