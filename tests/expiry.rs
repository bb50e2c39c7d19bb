mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;

use common::{
    MemoryRelay, TIMEOUT, client_with_options, drain_events, establish_session,
    expirer_targets, has_key, init_logger, next_event, required_namespaces, short_lived,
};
use walletconnect_sign::types::{Namespaces, SessionRequestObject};
use walletconnect_sign::utils::unix_timestamp;
use walletconnect_sign::{AuthRequestParams, Error, Lifetimes, MemoryStorage, SignEvent};

fn eth_sign_until(n: u64, expiry: u64) -> SessionRequestObject {
    SessionRequestObject {
        method: "eth_sign".into(),
        params: json!(["0xabc", format!("0x{n:02x}")]),
        expiry_timestamp: Some(expiry),
    }
}

#[tokio::test]
async fn test_session_expires_on_both_sides() {
    init_logger();
    let relay = MemoryRelay::new();
    let dapp_storage = Arc::new(MemoryStorage::new());
    let wallet_storage = Arc::new(MemoryStorage::new());
    let dapp = client_with_options(
        &relay,
        short_lived("dapp", Lifetimes::default()),
        dapp_storage.clone(),
    )
    .await;
    // the wallet settles, so its lifetime decides the session expiry
    let wallet = client_with_options(
        &relay,
        short_lived(
            "wallet",
            Lifetimes {
                session: 3,
                ..Default::default()
            },
        ),
        wallet_storage.clone(),
    )
    .await;
    let mut dapp_events = dapp.events();
    let mut wallet_events = wallet.events();

    let topic = establish_session(&dapp, &wallet).await;
    assert!(expirer_targets(&dapp_storage).await.contains(&format!("topic:{topic}")));

    for events in [&mut dapp_events, &mut wallet_events] {
        let expired = next_event(events, |e| match e {
            SignEvent::SessionExpire { topic } => Some(topic),
            _ => None,
        })
        .await;
        assert_eq!(expired, topic);
    }

    for (client, storage) in [(&dapp, &dapp_storage), (&wallet, &wallet_storage)] {
        assert!(client.sessions().await.unwrap().is_empty());
        assert!(!expirer_targets(storage).await.contains(&format!("topic:{topic}")));
        assert!(!has_key(storage, &topic).await);
    }
    assert_eq!(relay.subscriber_count(&topic), 0);
    assert!(matches!(
        dapp.ping(&topic).await,
        Err(Error::SessionNotFound(_))
    ));

    tokio::time::sleep(Duration::from_millis(500)).await;
    for events in [&mut dapp_events, &mut wallet_events] {
        let again = drain_events(events)
            .into_iter()
            .filter(|e| matches!(e, SignEvent::SessionExpire { .. }))
            .count();
        assert_eq!(again, 0);
    }
}

#[tokio::test]
async fn test_unused_pairing_expires_on_both_sides() {
    init_logger();
    let relay = MemoryRelay::new();
    let dapp_storage = Arc::new(MemoryStorage::new());
    let wallet_storage = Arc::new(MemoryStorage::new());
    let dapp = client_with_options(
        &relay,
        short_lived(
            "dapp",
            Lifetimes {
                pairing_inactive: 2,
                ..Default::default()
            },
        ),
        dapp_storage.clone(),
    )
    .await;
    let wallet = client_with_options(
        &relay,
        short_lived("wallet", Lifetimes::default()),
        wallet_storage.clone(),
    )
    .await;
    let mut dapp_events = dapp.events();
    let mut wallet_events = wallet.events();

    let created = dapp.create_pairing(None).await.unwrap();
    // the uri carries the dApp's expiry, which the wallet adopts
    let paired = wallet.pair(&created.uri).await.unwrap();
    assert_eq!(paired.expiry, dapp.pairings().await.unwrap()[0].expiry);

    for events in [&mut dapp_events, &mut wallet_events] {
        let expired = next_event(events, |e| match e {
            SignEvent::PairingExpired { topic } => Some(topic),
            _ => None,
        })
        .await;
        assert_eq!(expired, created.topic);
    }

    for (client, storage) in [(&dapp, &dapp_storage), (&wallet, &wallet_storage)] {
        assert!(client.pairings().await.unwrap().is_empty());
        assert!(!expirer_targets(storage).await.contains(&format!("topic:{}", created.topic)));
        assert!(!has_key(storage, &created.topic).await);
    }
    assert_eq!(relay.subscriber_count(&created.topic), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !drain_events(&mut dapp_events)
            .iter()
            .any(|e| matches!(e, SignEvent::PairingExpired { .. }))
    );
}

#[tokio::test]
async fn test_unanswered_proposal_times_out() {
    init_logger();
    let relay = MemoryRelay::new();
    let storage = Arc::new(MemoryStorage::new());
    let dapp = client_with_options(
        &relay,
        short_lived(
            "dapp",
            Lifetimes {
                proposal: 1,
                ..Default::default()
            },
        ),
        storage.clone(),
    )
    .await;
    let mut events = dapp.events();

    // nobody pairs, so nobody answers
    let connect = dapp
        .connect(required_namespaces(), Namespaces::new(), None)
        .await
        .unwrap();
    let id = connect.id;

    let outcome = tokio::time::timeout(TIMEOUT, connect.approval.wait())
        .await
        .unwrap();
    assert!(matches!(outcome, Err(Error::Timeout)));

    let expired = next_event(&mut events, |e| match e {
        SignEvent::ProposalExpire { id } => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(expired, id);
    assert!(dapp.proposals().await.unwrap().is_empty());
    assert!(!expirer_targets(&storage).await.contains(&format!("id:{id}")));
    // the pairing itself lives on
    assert_eq!(dapp.pairings().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, SignEvent::ProposalExpire { .. }))
    );
}

#[tokio::test]
async fn test_unanswered_request_expires_on_both_sides() {
    init_logger();
    let relay = MemoryRelay::new();
    let dapp_storage = Arc::new(MemoryStorage::new());
    let wallet_storage = Arc::new(MemoryStorage::new());
    let dapp = client_with_options(
        &relay,
        short_lived("dapp", Lifetimes::default()),
        dapp_storage.clone(),
    )
    .await;
    let wallet = client_with_options(
        &relay,
        short_lived("wallet", Lifetimes::default()),
        wallet_storage.clone(),
    )
    .await;
    let topic = establish_session(&dapp, &wallet).await;
    let mut dapp_events = dapp.events();
    let mut wallet_events = wallet.events();

    let pending = {
        let dapp = dapp.clone();
        let topic = topic.clone();
        let request = eth_sign_until(1, unix_timestamp() + 2);
        tokio::spawn(async move { dapp.request(&topic, "eip155:1", request).await })
    };

    let id = next_event(&mut wallet_events, |e| match e {
        SignEvent::SessionRequest { id, .. } => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(wallet.pending_requests().await.unwrap().len(), 1);

    for events in [&mut wallet_events, &mut dapp_events] {
        let expired = next_event(events, |e| match e {
            SignEvent::SessionRequestExpire { id } => Some(id),
            _ => None,
        })
        .await;
        assert_eq!(expired, id);
    }

    let outcome = tokio::time::timeout(TIMEOUT, pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::Timeout)));

    assert!(wallet.pending_requests().await.unwrap().is_empty());
    assert!(matches!(
        wallet.respond(&topic, id, Ok(json!("0xsig"))).await,
        Err(Error::NotFound(_))
    ));
    for storage in [&dapp_storage, &wallet_storage] {
        assert!(!expirer_targets(storage).await.contains(&format!("id:{id}")));
    }
    // the session is untouched
    assert_eq!(dapp.sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_request_is_answered_or_expired_never_both() {
    init_logger();
    let relay = MemoryRelay::new();
    let dapp = client_with_options(
        &relay,
        short_lived("dapp", Lifetimes::default()),
        Arc::new(MemoryStorage::new()),
    )
    .await;
    let wallet = client_with_options(
        &relay,
        short_lived("wallet", Lifetimes::default()),
        Arc::new(MemoryStorage::new()),
    )
    .await;
    let topic = establish_session(&dapp, &wallet).await;
    let mut wallet_events = wallet.events();

    let expiry = unix_timestamp() + 2;
    let mut handles = Vec::new();
    for n in 0..20 {
        let handle = dapp
            .send_request(&topic, "eip155:1", eth_sign_until(n, expiry))
            .await
            .unwrap();
        handles.push(handle);
    }
    let mut ids = Vec::new();
    while ids.len() < handles.len() {
        let id = next_event(&mut wallet_events, |e| match e {
            SignEvent::SessionRequest { id, .. } => Some(id),
            _ => None,
        })
        .await;
        ids.push(id);
    }

    // answer while the sweep is picking the same requests up
    while unix_timestamp() < expiry {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let answers = join_all(
        ids.iter()
            .map(|id| wallet.respond(&topic, *id, Ok(json!("0xsig")))),
    )
    .await;

    let mut answered = HashSet::new();
    for (id, answer) in ids.iter().zip(&answers) {
        match answer {
            Ok(()) => {
                answered.insert(*id);
            }
            Err(e) => assert!(matches!(e, Error::NotFound(_)), "{e}"),
        }
    }

    let mut expired = HashSet::new();
    while answered.len() + expired.len() < ids.len() {
        let id = next_event(&mut wallet_events, |e| match e {
            SignEvent::SessionRequestExpire { id } => Some(id),
            _ => None,
        })
        .await;
        assert!(!answered.contains(&id), "request {id} answered and expired");
        assert!(expired.insert(id), "request {id} expired twice");
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !drain_events(&mut wallet_events)
            .iter()
            .any(|e| matches!(e, SignEvent::SessionRequestExpire { .. }))
    );
    assert!(wallet.pending_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unanswered_authenticate_times_out() {
    init_logger();
    let relay = MemoryRelay::new();
    let storage = Arc::new(MemoryStorage::new());
    let dapp = client_with_options(
        &relay,
        short_lived(
            "dapp",
            Lifetimes {
                auth_request: 1,
                ..Default::default()
            },
        ),
        storage.clone(),
    )
    .await;

    let auth = dapp
        .authenticate(
            AuthRequestParams {
                chains: vec!["eip155:1".into()],
                domain: "app.example".into(),
                uri: "https://app.example/login".into(),
                nonce: "1".into(),
                statement: None,
                resources: vec![],
            },
            None,
        )
        .await
        .unwrap();
    let id = auth.id;

    let outcome = tokio::time::timeout(TIMEOUT, auth.approval.wait())
        .await
        .unwrap();
    assert!(matches!(outcome, Err(Error::Timeout)));
    assert!(!expirer_targets(&storage).await.contains(&format!("id:{id}")));
}
