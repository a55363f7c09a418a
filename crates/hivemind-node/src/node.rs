//! Node implementation - swarm member orchestrator
//!
//! The Node joins the swarm through the signaling relay, keeps one session
//! per remote peer, serves tasks with its compute worker and dispatches its
//! own tasks to connected peers.
//!
//! # Example
//!
//! ```no_run
//! use hivemind_node::link::MemoryNetwork;
//! use hivemind_node::{EchoWorker, Node, NodeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let node = Node::new(
//!         NodeConfig::with_relay("ws://127.0.0.1:3000"),
//!         Arc::new(network.transport()),
//!         Arc::new(EchoWorker),
//!     );
//!     node.start().await?;
//!
//!     let report = node.dispatch(b"hello".to_vec()).await?;
//!     println!("{} answered {:?}", report.peer_id, report.result);
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

use crate::config::NodeConfig;
use crate::dispatcher::{TaskDispatcher, TaskReport};
use crate::driver::{DriverContext, SessionCommand, SessionDriver, SignalSink};
use crate::error::{DispatchError, NodeError, Result};
use crate::event::NodeEvent;
use crate::link::LinkTransport;
use crate::session::{PeerSession, Role, SessionState};
use crate::table::SessionTable;
use crate::worker::ComputeWorker;
use hivemind_protocol::{NegotiationSignal, PeerId, PeerMessage, TaskMessage, TaskResult};
use hivemind_relay::{RelayEvent, SignalingClient};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

/// Node inner state
struct NodeInner {
    /// Local peer id registered with the relay
    peer_id: PeerId,
    /// Node configuration
    config: NodeConfig,
    /// Direct-link transport
    transport: Arc<dyn LinkTransport>,
    /// Worker serving inbound tasks
    worker: Arc<dyn ComputeWorker>,
    /// Live sessions (remote peer id -> entry)
    table: Arc<SessionTable>,
    /// Outstanding dispatches
    dispatcher: TaskDispatcher,
    /// Relay connection while running
    signaling: RwLock<Option<Arc<SignalingClient>>>,
    /// Event stream sender
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    /// Event stream receiver, until taken by the application
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
    /// Node running state
    running: AtomicBool,
    /// Stops background loops
    shutdown: watch::Sender<bool>,
}

/// A member of the compute swarm
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node with a random peer id
    #[must_use]
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn LinkTransport>,
        worker: Arc<dyn ComputeWorker>,
    ) -> Self {
        Self::with_peer_id(PeerId::generate(), config, transport, worker)
    }

    /// Create a node with a fixed peer id
    #[must_use]
    pub fn with_peer_id(
        peer_id: PeerId,
        config: NodeConfig,
        transport: Arc<dyn LinkTransport>,
        worker: Arc<dyn ComputeWorker>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = NodeInner {
            peer_id,
            dispatcher: TaskDispatcher::new(config.dispatch_timeout),
            config,
            transport,
            worker,
            table: Arc::new(SessionTable::new()),
            signaling: RwLock::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            running: AtomicBool::new(false),
            shutdown,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Local peer id
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Take the event stream
    ///
    /// Returns `None` after the first call.
    #[must_use]
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.inner.events_rx.lock().ok()?.take()
    }

    /// Join the swarm
    ///
    /// Connects to the relay, registers the local peer id and starts
    /// negotiating with every peer in the membership snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` for a bad configuration,
    /// `NodeError::InvalidState` if already running, or the relay
    /// connection error.
    pub async fn start(&self) -> Result<()> {
        self.inner.config.validate()?;

        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node already running"));
        }

        let connected = SignalingClient::connect(
            self.inner.config.signaling.clone(),
            self.inner.peer_id.clone(),
        )
        .await;
        let (client, relay_events) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let client = Arc::new(client);
        *self.inner.signaling.write().await = Some(Arc::clone(&client));
        self.inner.shutdown.send_replace(false);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let signals: Arc<dyn SignalSink> = client;
        let ctx = DriverContext {
            local: self.inner.peer_id.clone(),
            transport: Arc::clone(&self.inner.transport),
            signals,
            table: Arc::clone(&self.inner.table),
            events: self.inner.events_tx.clone(),
            inbound: inbound_tx,
            negotiation_timeout: self.inner.config.negotiation_timeout,
        };

        let node = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            node.relay_loop(ctx, relay_events, shutdown).await;
        });

        let node = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            node.inbound_loop(inbound_rx, shutdown).await;
        });

        info!(
            peer_id = %self.inner.peer_id,
            relay = %self.inner.config.signaling.relay_url,
            transport = self.inner.transport.name(),
            "node started"
        );
        Ok(())
    }

    /// Leave the swarm
    ///
    /// Closes every session and channel and disconnects from the relay.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if the node is not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node not running"));
        }

        self.inner.shutdown.send_replace(true);

        let sessions = self.inner.table.drain();
        let closed = sessions.len();
        for (commands, channel) in sessions {
            let _ = commands.send(SessionCommand::Close);
            if let Some(channel) = channel {
                channel.close();
            }
        }

        if let Some(client) = self.inner.signaling.write().await.take() {
            client.disconnect().await;
        }

        info!(peer_id = %self.inner.peer_id, sessions = closed, "node stopped");
        Ok(())
    }

    /// Check if node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Send `payload` to a random connected peer and wait for its result
    ///
    /// A worker failure on the remote side is a successful dispatch whose
    /// report carries `TaskResult::Failure`.
    ///
    /// # Errors
    ///
    /// See [`TaskDispatcher::dispatch`].
    pub async fn dispatch(&self, payload: Vec<u8>) -> std::result::Result<TaskReport, DispatchError> {
        let peers = self.inner.table.connected_peers();
        self.inner.dispatcher.dispatch(&peers, payload).await
    }

    /// Peers with an open channel
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .table
            .connected_peers()
            .into_iter()
            .map(|peer| peer.peer_id)
            .collect()
    }

    /// Current session state for `remote`, if a session exists
    #[must_use]
    pub fn session_state(&self, remote: &PeerId) -> Option<SessionState> {
        self.inner.table.state(remote)
    }

    /// Negotiation role of the session for `remote`, if one exists
    #[must_use]
    pub fn session_role(&self, remote: &PeerId) -> Option<Role> {
        self.inner.table.role(remote)
    }

    /// Number of live sessions, in any state
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Number of dispatches awaiting a result
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    /// Close the session with `remote`
    ///
    /// # Errors
    ///
    /// Returns `NodeError::SessionNotFound` if there is no live session.
    pub fn close_session(&self, remote: &PeerId) -> Result<()> {
        if self.inner.table.send(remote, SessionCommand::Close) {
            Ok(())
        } else {
            Err(NodeError::SessionNotFound(remote.clone()))
        }
    }

    /// Consume relay notifications until shutdown or relay loss
    async fn relay_loop(
        self,
        ctx: DriverContext,
        mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = relay_events.recv() => match event {
                    Some(RelayEvent::Peers(peers)) => {
                        debug!(count = peers.len(), "membership snapshot");
                        for remote in peers {
                            open_session(&ctx, remote, Role::Initiator);
                        }
                    }
                    Some(RelayEvent::PeerJoined(remote)) => {
                        open_session(&ctx, remote, Role::Responder);
                    }
                    Some(RelayEvent::PeerLeft(remote)) => {
                        if !ctx.table.send(&remote, SessionCommand::PeerLeft) {
                            debug!(%remote, "peer left without a session");
                        }
                    }
                    Some(RelayEvent::Signal { from, payload }) => {
                        route_signal(&ctx, from, &payload);
                    }
                    Some(RelayEvent::Disconnected) | None => {
                        if !*shutdown.borrow() {
                            warn!(peer_id = %self.inner.peer_id, "relay connection lost");
                            let _ = self.inner.events_tx.send(NodeEvent::RelayDisconnected);
                        }
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(peer_id = %self.inner.peer_id, "relay loop stopped");
    }

    /// Handle messages arriving on peer channels
    async fn inbound_loop(
        self,
        mut inbound: mpsc::UnboundedReceiver<(PeerId, String)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some((from, raw)) => self.handle_peer_message(from, &raw),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    fn handle_peer_message(&self, from: PeerId, raw: &str) {
        match PeerMessage::decode(raw) {
            Ok(PeerMessage::Task(task)) => self.serve_task(from, task),
            Ok(PeerMessage::Result(result)) => {
                let task_id = result.task_id.clone();
                if self.inner.dispatcher.resolve(&from, result) {
                    let _ = self.inner.events_tx.send(NodeEvent::ResultReceived {
                        peer_id: from,
                        task_id,
                    });
                }
            }
            Err(e) => debug!(peer = %from, error = %e, "dropping malformed peer message"),
        }
    }

    /// Run the worker on its own task and reply over the current channel
    fn serve_task(&self, from: PeerId, task: TaskMessage) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let TaskMessage { task_id, payload } = task;

            let outcome = match inner.worker.process(payload).await {
                Ok(output) => TaskResult::Success(output),
                Err(e) => {
                    debug!(peer = %from, %task_id, error = %e, "worker failed");
                    TaskResult::Failure(e.to_string())
                }
            };
            let success = outcome.is_success();

            let reply = match PeerMessage::result(task_id.clone(), outcome).encode() {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(peer = %from, %task_id, error = %e, "failed to encode result");
                    return;
                }
            };

            match inner.table.channel(&from) {
                Some(channel) => {
                    if let Err(e) = channel.send(reply) {
                        warn!(peer = %from, %task_id, error = %e, "failed to send result");
                    }
                }
                None => warn!(peer = %from, %task_id, "no open channel, dropping result"),
            }

            let _ = inner.events_tx.send(NodeEvent::TaskServed {
                peer_id: from,
                task_id,
                success,
            });
        });
    }
}

/// Spawn a driver for `remote` unless a session already exists
fn open_session(ctx: &DriverContext, remote: PeerId, role: Role) -> bool {
    if remote == ctx.local {
        return false;
    }

    let (commands, commands_rx) = mpsc::unbounded_channel();
    let Some(generation) = ctx.table.insert_if_absent(&remote, role, commands) else {
        debug!(%remote, ?role, "session already exists");
        return false;
    };

    debug!(%remote, ?role, generation, "opening session");
    let driver = SessionDriver::new(
        ctx.clone(),
        PeerSession::new(remote, role),
        generation,
        commands_rx,
    );
    tokio::spawn(driver.run());
    true
}

/// Hand a relayed signal to its session, creating a responder for a new offer
fn route_signal(ctx: &DriverContext, from: PeerId, payload: &Value) {
    let signal = match NegotiationSignal::from_payload(payload) {
        Ok(signal) => signal,
        Err(e) => {
            debug!(%from, error = %e, "dropping malformed signal");
            return;
        }
    };

    if ctx.table.state(&from).is_none() {
        if !signal.is_offer() {
            debug!(%from, kind = signal.kind(), "dropping signal without a session");
            return;
        }
        open_session(ctx, from.clone(), Role::Responder);
    }

    if !ctx.table.send(&from, SessionCommand::Signal(signal)) {
        debug!(%from, "session ended before signal delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryNetwork;
    use crate::worker::EchoWorker;
    use hivemind_relay::RelayServer;

    fn node(relay_url: &str) -> Node {
        Node::new(
            NodeConfig::with_relay(relay_url),
            Arc::new(MemoryNetwork::new().transport()),
            Arc::new(EchoWorker),
        )
    }

    async fn relay() -> (Arc<RelayServer>, String) {
        let server = Arc::new(RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let url = format!("ws://{}", server.local_addr());
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        (server, url)
    }

    #[test]
    fn test_node_creation() {
        let node = node("ws://127.0.0.1:3000");
        assert!(node.peer_id().as_str().starts_with("peer-"));
        assert!(!node.is_running());
        assert_eq!(node.session_count(), 0);
        assert!(node.connected_peers().is_empty());
    }

    #[test]
    fn test_events_taken_once() {
        let node = node("ws://127.0.0.1:3000");
        assert!(node.events().is_some());
        assert!(node.events().is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let node = node("http://127.0.0.1:3000");
        assert!(matches!(
            node.start().await,
            Err(NodeError::InvalidConfig(_))
        ));
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let node = node("ws://127.0.0.1:3000");
        assert!(matches!(node.stop().await, Err(NodeError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_dispatch_without_peers() {
        let node = node("ws://127.0.0.1:3000");
        assert_eq!(
            node.dispatch(b"x".to_vec()).await,
            Err(DispatchError::NoPeers)
        );
        assert_eq!(node.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let node = node("ws://127.0.0.1:3000");
        let remote = PeerId::new("peer-nobody");
        assert!(matches!(
            node.close_session(&remote),
            Err(NodeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let (server, url) = relay().await;
        let node = node(&url);

        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(matches!(
            node.start().await,
            Err(NodeError::InvalidState(_))
        ));

        while server.peer_count().await == 0 {
            tokio::task::yield_now().await;
        }

        node.stop().await.unwrap();
        assert!(!node.is_running());
        server.shutdown().await;
    }

    #[test]
    fn test_route_signal_ignores_non_offer_for_unknown_peer() {
        let network = MemoryNetwork::new();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (inbound, _inbound_rx) = mpsc::unbounded_channel();

        struct NoSignals;
        impl SignalSink for NoSignals {
            fn deliver(&self, _: &PeerId, _: &NegotiationSignal) -> Result<()> {
                Ok(())
            }
        }

        let ctx = DriverContext {
            local: PeerId::new("peer-a"),
            transport: Arc::new(network.transport()),
            signals: Arc::new(NoSignals),
            table: Arc::new(SessionTable::new()),
            events,
            inbound,
            negotiation_timeout: std::time::Duration::from_secs(30),
        };

        let answer = serde_json::json!({"type": "answer", "answer": {"token": "t"}});
        route_signal(&ctx, PeerId::new("peer-b"), &answer);
        assert_eq!(ctx.table.len(), 0);

        route_signal(&ctx, PeerId::new("peer-b"), &serde_json::json!({"type": "bogus"}));
        assert_eq!(ctx.table.len(), 0);

        assert!(!open_session(&ctx, PeerId::new("peer-a"), Role::Initiator));
    }
}
