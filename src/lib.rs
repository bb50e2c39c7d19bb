//! # walletconnect-sign
//!
//! A Rust implementation of the [WalletConnect v2](https://specs.walletconnect.com/2.0/)
//! pairing and Sign protocols, for both the dApp and the wallet side.
//!
//! ## Features
//! - Pairing URIs (`wc:` scheme), ping and delete
//! - Session propose / approve / reject / settle
//! - Session requests, events, update, extend, ping and disconnect
//! - One-shot `wc_sessionAuthenticate` with CACAO verification
//! - Encrypted envelopes (type 0 and type 1), relay JWT auth
//! - Reconnect with backoff and resubscribe, persisted state, expiry
//!
//! ## Example
//! Wallet side: pair with a URI from a dApp and approve its proposal.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use walletconnect_sign::{
//!     ClientOptions, FileStorage, SignClient, SignEvent, WsTransport,
//!     types::{Metadata, Namespace},
//! };
//!
//! # async fn run() -> walletconnect_sign::Result<()> {
//! // Get project_id from https://cloud.reown.com
//! let options = ClientOptions::new(
//!     "xxxx",
//!     Metadata {
//!         name: "My Wallet Name".to_string(),
//!         description: "My wallet interacts with dapp".to_string(),
//!         url: "https://my-wallet-site.com".to_string(),
//!         icons: vec![],
//!     },
//! );
//! let client = SignClient::init(
//!     options,
//!     Arc::new(WsTransport),
//!     Arc::new(FileStorage::new("wc-state.json")),
//! )
//! .await?;
//!
//! let mut events = client.events();
//! client.pair("wc:e4b9eb7a...@2?relay-protocol=irn&symKey=d743...").await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SignEvent::SessionProposal { id, .. } = event {
//!         let namespaces = [(
//!             "eip155".to_string(),
//!             Namespace {
//!                 accounts: vec!["eip155:1:0x0000000000000000000000000000000000000123".into()],
//!                 methods: vec!["personal_sign".into()],
//!                 ..Default::default()
//!             },
//!         )]
//!         .into();
//!         let session = client.approve(id, namespaces, None).await?;
//!         println!("session: {}", session.topic);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//! MIT OR Apache-2.0

pub mod cacao;
pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod expirer;
pub mod message;
pub mod messenger;
pub mod namespaces;
pub mod pairing;
pub mod provider;
pub mod publisher;
pub mod relay_auth;
pub mod relayer;
pub mod storage;
pub mod store;
pub mod subscriber;
pub mod types;
pub mod utils;
pub mod wc_message;

/// Exposed for easy access
pub use client::SignClient;
pub use config::{AppIdentity, ClientOptions, Lifetimes};
pub use engine::{AuthRequestParams, Session};
pub use error::{Error, Result};
pub use events::SignEvent;
pub use provider::{Transport, WsTransport};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
