//! # Hivemind Relay
//!
//! Rendezvous infrastructure for the Hivemind swarm.
//!
//! Nodes connect to the relay over WebSocket, register a peer id, learn the
//! current membership, and exchange opaque negotiation envelopes addressed by
//! peer id. The relay never carries task traffic: once two nodes share a
//! direct link they stop talking through it.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │  Relay Server   │
//!                    │   (registry)    │
//!                    └────────┬────────┘
//!               register/peers│signal/peer-left
//!              ┌──────────────┴──────────────┐
//!              │                              │
//!              ▼                              ▼
//!       ┌─────────────┐   direct link  ┌─────────────┐
//!       │   Node A    │◄──────────────►│   Node B    │
//!       └─────────────┘  task / result └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use hivemind_relay::{RelayServer, SignalingClient, SignalingConfig};
//! use hivemind_protocol::PeerId;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(RelayServer::bind("127.0.0.1:3000".parse()?).await?);
//! let running = Arc::clone(&server);
//! tokio::spawn(async move { running.run().await });
//!
//! let config = SignalingConfig::new("ws://127.0.0.1:3000");
//! let (client, mut events) = SignalingClient::connect(config, PeerId::generate()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("relay event: {event:?}");
//! }
//! # client.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod registry;
pub mod server;

pub use client::{RelayEvent, SignalingClient, SignalingConfig, SignalingState};
pub use error::RelayError;
pub use registry::{ConnectionId, PeerRecord, Registry};
pub use server::{RelayServer, RelayServerConfig};

/// Relay heartbeat interval (30 seconds)
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Client-side application ping interval (25 seconds)
pub const CLIENT_PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(25);

/// Relay connection timeout (10 seconds)
pub const RELAY_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
