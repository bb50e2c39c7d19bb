/// Events
///
/// Everything the application layer can observe. Components hold a clone of
/// the `EventBus` and emit into it; applications call `subscribe` and get
/// their own receiver, which they drop to unsubscribe.
///
use serde_json::Value;
use tokio::sync::broadcast;

use crate::types::{
    Metadata, Namespaces, SessionAuthenticateParams, SessionEventObject,
    SessionProposeParams, SessionRequestObject,
};

#[derive(Clone, Debug, PartialEq)]
pub enum SignEvent {
    /// Wallet side: a dApp wants a session. Answer with `approve` or `reject`.
    SessionProposal {
        id: u64,
        params: SessionProposeParams,
    },
    SessionRequest {
        id: u64,
        topic: String,
        chain_id: String,
        request: SessionRequestObject,
    },
    SessionEvent {
        id: u64,
        topic: String,
        chain_id: String,
        event: SessionEventObject,
    },
    SessionUpdate {
        id: u64,
        topic: String,
        namespaces: Namespaces,
    },
    SessionExtend {
        id: u64,
        topic: String,
        expiry: u64,
    },
    SessionPing {
        id: u64,
        topic: String,
    },
    SessionDelete {
        id: u64,
        topic: String,
    },
    SessionExpire {
        topic: String,
    },
    ProposalExpire {
        id: u64,
    },
    SessionRequestExpire {
        id: u64,
    },
    SessionAuthenticate {
        id: u64,
        topic: String,
        params: SessionAuthenticateParams,
    },
    PairingPing {
        id: u64,
        topic: String,
    },
    PairingDeleted {
        topic: String,
    },
    PairingExpired {
        topic: String,
    },
    PairingMetadata {
        topic: String,
        metadata: Metadata,
    },
    /// The relay acknowledged a publish; says nothing about the peer.
    PublishedMessage {
        topic: String,
        message: String,
        tag: u16,
    },
    RelayConnected,
    RelayDisconnected,
    /// An inbound message that could not be decoded or routed
    Error {
        topic: String,
        reason: String,
        data: Option<Value>,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SignEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: SignEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_subscriber_sees_every_event() {
        let bus = EventBus::default();
        bus.emit(SignEvent::RelayConnected);

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(SignEvent::PairingDeleted { topic: "t".into() });

        let expected = SignEvent::PairingDeleted { topic: "t".into() };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
        assert!(a.try_recv().is_err());
    }
}
