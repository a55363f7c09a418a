//! # Hivemind Node
//!
//! A member of the Hivemind compute swarm.
//!
//! This crate provides:
//! - Peer sessions negotiated through the signaling relay
//! - Pluggable direct-link transports (in-process and TCP)
//! - Task dispatch with result correlation and timeouts
//! - Compute workers that serve tasks from other peers
//!
//! ## Architecture
//!
//! ```text
//!                  relay events                 link events
//!   SignalingClient ──────────► Node ──► SessionDriver (one per peer)
//!          ▲                     │             │
//!          │  offer/answer/      │             ▼
//!          └── candidates ◄──────┼──────── LinkNegotiator ──► LinkChannel
//!                                │                                │
//!                   TaskDispatcher ◄──── task / result ───────────┘
//! ```
//!
//! Signaling carries only negotiation traffic. Tasks and results flow over
//! the direct channels.
//!
//! ## Example
//!
//! ```no_run
//! use hivemind_node::link::MemoryNetwork;
//! use hivemind_node::{DenseLayerWorker, Node, NodeConfig, NodeEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let node = Node::new(
//!         NodeConfig::with_relay("ws://127.0.0.1:3000"),
//!         Arc::new(network.transport()),
//!         Arc::new(DenseLayerWorker),
//!     );
//!     let mut events = node.events().expect("first call");
//!     node.start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let NodeEvent::PeerConnected(peer) = event {
//!             println!("connected to {peer}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
mod driver;
pub mod error;
pub mod event;
pub mod link;
mod node;
pub mod session;
mod table;
pub mod worker;

pub use config::{LinkConfig, NodeConfig};
pub use dispatcher::{ConnectedPeer, TaskDispatcher, TaskReport};
pub use driver::SignalSink;
pub use error::{DispatchError, NodeError, Result, SessionError};
pub use event::{DisconnectReason, NodeEvent};
pub use link::{LinkChannel, LinkError, LinkEvent, LinkNegotiator, LinkTransport};
pub use node::Node;
pub use session::{NegotiationPhase, PeerSession, Role, SessionState};
pub use worker::{ComputeWorker, DenseLayerRequest, DenseLayerResponse, DenseLayerWorker, EchoWorker, WorkerError};
