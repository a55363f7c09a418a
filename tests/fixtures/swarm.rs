//! Swarm test fixture
//!
//! Runs a real relay on `127.0.0.1:0` and attaches nodes to it. Nodes share
//! an in-process [`MemoryNetwork`] for their direct links unless a test
//! supplies its own transport.
//!
//! # Example
//!
//! ```no_run
//! use hivemind_integration_tests::fixtures::SwarmFixture;
//! use hivemind_node::EchoWorker;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let swarm = SwarmFixture::new().await.unwrap();
//! let mut a = swarm.spawn_node("peer-a", Arc::new(EchoWorker)).await.unwrap();
//! let mut b = swarm.spawn_node("peer-b", Arc::new(EchoWorker)).await.unwrap();
//!
//! a.wait_connected(b.node.peer_id()).await;
//! b.wait_connected(a.node.peer_id()).await;
//!
//! let report = a.node.dispatch(b"ping".to_vec()).await.unwrap();
//! swarm.shutdown().await;
//! # }
//! ```

use hivemind_node::link::MemoryNetwork;
use hivemind_node::{ComputeWorker, LinkTransport, Node, NodeConfig, NodeError, NodeEvent};
use hivemind_protocol::PeerId;
use hivemind_relay::{RelayError, RelayServer, RelayServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long fixture helpers wait before giving up
pub const WAIT: Duration = Duration::from_secs(5);

/// A relay plus the nodes attached to it
pub struct SwarmFixture {
    /// Running relay
    pub relay: Arc<RelayServer>,
    /// `ws://` URL of the relay
    pub relay_url: String,
    /// Shared in-process link hub
    pub network: MemoryNetwork,
    relay_task: JoinHandle<Result<(), RelayError>>,
}

/// A started node and its event stream
pub struct SwarmNode {
    /// The node
    pub node: Node,
    /// Its events
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
}

impl SwarmFixture {
    /// Start a relay with default settings
    ///
    /// # Errors
    ///
    /// Returns `RelayError` if the relay cannot bind.
    pub async fn new() -> Result<Self, RelayError> {
        Self::with_relay_config(RelayServerConfig::default()).await
    }

    /// Start a relay with custom settings
    ///
    /// # Errors
    ///
    /// Returns `RelayError` if the relay cannot bind.
    pub async fn with_relay_config(config: RelayServerConfig) -> Result<Self, RelayError> {
        let relay = Arc::new(
            RelayServer::bind_with_config(([127, 0, 0, 1], 0).into(), config).await?,
        );
        let relay_url = format!("ws://{}", relay.local_addr());

        let runner = Arc::clone(&relay);
        let relay_task = tokio::spawn(async move { runner.run().await });

        Ok(Self {
            relay,
            relay_url,
            network: MemoryNetwork::new(),
            relay_task,
        })
    }

    /// Node configuration pointing at this relay
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::with_relay(self.relay_url.clone())
    }

    /// Start a node on the shared memory network
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if the node cannot start or register in time.
    pub async fn spawn_node(
        &self,
        name: &str,
        worker: Arc<dyn ComputeWorker>,
    ) -> Result<SwarmNode, NodeError> {
        self.spawn_node_with(name, self.node_config(), Arc::new(self.network.transport()), worker)
            .await
    }

    /// Start a node with its own configuration and transport
    ///
    /// Returns once the relay counts the node as registered, so nodes
    /// spawned one after another join in that order.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if the node cannot start or register in time.
    pub async fn spawn_node_with(
        &self,
        name: &str,
        config: NodeConfig,
        transport: Arc<dyn LinkTransport>,
        worker: Arc<dyn ComputeWorker>,
    ) -> Result<SwarmNode, NodeError> {
        let before = self.relay.peer_count().await;

        let node = Node::with_peer_id(PeerId::new(name), config, transport, worker);
        let events = node
            .events()
            .ok_or(NodeError::invalid_state("event stream already taken"))?;
        node.start().await?;

        let registered = wait_until(|| {
            let relay = Arc::clone(&self.relay);
            async move { relay.peer_count().await > before }
        })
        .await;
        if !registered {
            return Err(NodeError::invalid_state("node did not register in time"));
        }

        Ok(SwarmNode { node, events })
    }

    /// Stop the relay
    pub async fn shutdown(self) {
        self.relay.shutdown().await;
        let _ = self.relay_task.await;
    }
}

impl SwarmNode {
    /// Wait for the first event matching `predicate`, skipping others
    pub async fn wait_for(&mut self, predicate: impl Fn(&NodeEvent) -> bool) -> Option<NodeEvent> {
        tokio::time::timeout(WAIT, async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Wait until the channel to `peer` is open
    ///
    /// # Panics
    ///
    /// Panics if the peer does not connect in time.
    pub async fn wait_connected(&mut self, peer: &PeerId) {
        let connected = self
            .wait_for(|event| matches!(event, NodeEvent::PeerConnected(p) if p == peer))
            .await;
        assert!(
            connected.is_some(),
            "{} never connected to {peer}",
            self.node.peer_id()
        );
    }

    /// Wait for the session with `peer` to end and return the event
    pub async fn wait_disconnected(&mut self, peer: &PeerId) -> Option<NodeEvent> {
        self.wait_for(
            |event| matches!(event, NodeEvent::PeerDisconnected { peer_id, .. } if peer_id == peer),
        )
        .await
    }
}

/// Poll `condition` until it holds or [`WAIT`] elapses
pub async fn wait_until<F, Fut>(condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
