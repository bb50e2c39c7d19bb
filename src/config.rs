/// Config
///
/// Client options. Timeouts, retries, backoff and record lifetimes default to
/// the protocol constants but are all overridable.
///
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{
    AUTH_REQUEST_TTL, PAIRING_ACTIVE_TTL, PAIRING_INACTIVE_TTL, PROPOSAL_TTL,
    RELAY_DEFAULT_URL, SESSION_REQUEST_TTL, SESSION_TTL,
};
use crate::types::Metadata;
use crate::wc_message::WcMethod;

/// How the relay knows which app is connecting. Sent as one extra query
/// param on the relay URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppIdentity {
    Origin(String),
    BundleId(String),
    PackageName(String),
}

impl AppIdentity {
    pub fn query_pair(&self) -> (&'static str, &str) {
        match self {
            AppIdentity::Origin(v) => ("origin", v),
            AppIdentity::BundleId(v) => ("bundleId", v),
            AppIdentity::PackageName(v) => ("packageName", v),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestTimeouts {
    /// `irn_*` calls to the relay itself
    pub relay: Duration,
    /// Per-method overrides for peer requests. Methods without one wait for
    /// their relay ttl.
    pub overrides: HashMap<WcMethod, Duration>,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            relay: Duration::from_secs(10),
            overrides: HashMap::new(),
        }
    }
}

impl RequestTimeouts {
    pub fn for_method(&self, method: WcMethod) -> Duration {
        self.overrides
            .get(&method)
            .copied()
            .unwrap_or_else(|| Duration::from_secs(method.request_options().ttl))
    }
}

/// Bounded retry for publishing; only transient errors are retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn delay(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Exponential backoff for relay reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// How long each kind of record lives, in seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lifetimes {
    pub pairing_inactive: u64,
    pub pairing_active: u64,
    pub proposal: u64,
    pub session: u64,
    /// Used when the request carries no `expiryTimestamp` of its own.
    pub session_request: u64,
    pub auth_request: u64,
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            pairing_inactive: PAIRING_INACTIVE_TTL,
            pairing_active: PAIRING_ACTIVE_TTL,
            proposal: PROPOSAL_TTL,
            session: SESSION_TTL,
            session_request: SESSION_REQUEST_TTL,
            auth_request: AUTH_REQUEST_TTL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    // Get project_id from https://cloud.reown.com
    pub project_id: String,
    pub relay_url: String,
    pub metadata: Metadata,
    pub app_identity: Option<AppIdentity>,
    pub request_timeouts: RequestTimeouts,
    pub publish_retry: RetryPolicy,
    pub reconnect: BackoffPolicy,
    pub lifetimes: Lifetimes,
    pub expirer_tick: Duration,
}

impl ClientOptions {
    pub fn new(project_id: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            project_id: project_id.into(),
            relay_url: RELAY_DEFAULT_URL.to_string(),
            metadata,
            app_identity: None,
            request_timeouts: RequestTimeouts::default(),
            publish_retry: RetryPolicy::default(),
            reconnect: BackoffPolicy::default(),
            lifetimes: Lifetimes::default(),
            expirer_tick: Duration::from_secs(1),
        }
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = relay_url.into();
        self
    }

    pub fn with_app_identity(mut self, identity: AppIdentity) -> Self {
        self.app_identity = Some(identity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay(1), Duration::from_millis(500));
        assert_eq!(retry.delay(2), Duration::from_millis(1000));
        assert_eq!(retry.delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_method_timeouts() {
        let mut timeouts = RequestTimeouts::default();
        assert_eq!(
            timeouts.for_method(WcMethod::SessionPing),
            Duration::from_secs(30)
        );
        timeouts
            .overrides
            .insert(WcMethod::SessionRequest, Duration::from_secs(5));
        assert_eq!(
            timeouts.for_method(WcMethod::SessionRequest),
            Duration::from_secs(5)
        );
    }
}
