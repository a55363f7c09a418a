//! Connection and peer registry.
//!
//! The registry is the relay's only shared state. Every mutation happens
//! while the caller holds the server's write lock, so a peer id is bound to
//! at most one connection and `peer-left` is announced at most once per
//! binding.

use hivemind_protocol::{Envelope, PeerId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Relay-assigned identifier for one client connection
pub type ConnectionId = u64;

/// Frames queued for a connection's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded envelope
    Text(String),
    /// Transport-level liveness probe
    Ping,
    /// Close the connection
    Close,
}

/// Registration of a peer id to a live connection
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Connection the id is bound to
    pub connection: ConnectionId,
    /// When the id was registered
    pub registered_at: Instant,
    /// Last time any frame arrived on the bound connection
    pub last_seen: Instant,
}

/// A connected client, registered or not
#[derive(Debug)]
struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    peer_id: Option<PeerId>,
    alive: bool,
    signals: SignalWindow,
}

impl Connection {
    fn send(&self, frame: Outbound) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Per-connection signal rate window
#[derive(Debug)]
struct SignalWindow {
    started: Instant,
    count: usize,
}

impl SignalWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    fn check(&mut self, limit: usize, window: Duration) -> bool {
        let now = Instant::now();

        if now.duration_since(self.started) >= window {
            self.started = now;
            self.count = 0;
        }

        if self.count >= limit {
            return false;
        }

        self.count += 1;
        true
    }
}

/// Outcome of forwarding a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Handed to the target's writer
    Forwarded,
    /// Sender has no registered identity
    SenderUnregistered,
    /// No connection is registered under the target id
    UnknownTarget,
    /// Target connection is no longer open
    TargetClosed,
    /// Sender exceeded its signal budget
    RateLimited,
}

/// Membership state of the relay
#[derive(Debug)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    peers: HashMap<PeerId, PeerRecord>,
    signal_limit: usize,
    closed: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl Registry {
    /// Create an empty registry
    ///
    /// `signal_limit` caps signals forwarded per connection per second.
    #[must_use]
    pub fn new(signal_limit: usize) -> Self {
        Self {
            connections: HashMap::new(),
            peers: HashMap::new(),
            signal_limit,
            closed: false,
        }
    }

    /// Track a freshly accepted connection
    ///
    /// Returns `false` once the registry has been closed.
    pub fn add_connection(
        &mut self,
        id: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> bool {
        if self.closed {
            return false;
        }

        self.connections.insert(
            id,
            Connection {
                outbound,
                peer_id: None,
                alive: true,
                signals: SignalWindow::new(),
            },
        );
        true
    }

    /// Record inbound activity on a connection
    pub fn touch(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.alive = true;

        if let Some(peer_id) = &conn.peer_id {
            if let Some(record) = self.peers.get_mut(peer_id) {
                record.last_seen = Instant::now();
            }
        }
    }

    /// Bind `peer_id` to connection `id`
    ///
    /// The registrant receives the current membership (excluding itself) and
    /// every other registered connection receives `peer-joined`. Registering
    /// an id that is already bound elsewhere moves the binding to the newer
    /// connection; the older connection stays open but unregistered.
    pub fn register(&mut self, id: ConnectionId, peer_id: PeerId) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };

        match conn.peer_id.clone() {
            Some(current) if current == peer_id => {
                // Same binding again: refresh the snapshot only
                self.send_snapshot(id, &peer_id);
                return;
            }
            Some(previous) => {
                debug!(connection = id, %previous, %peer_id, "connection re-registering under new id");
                if self.unbind(&previous, id) {
                    self.broadcast(&Envelope::PeerLeft { peer_id: previous }, Some(id));
                }
            }
            None => {}
        }

        if let Some(existing) = self.peers.get(&peer_id).map(|r| r.connection) {
            warn!(%peer_id, old = existing, new = id, "peer id re-registered, moving binding");
            if let Some(old) = self.connections.get_mut(&existing) {
                old.peer_id = None;
            }
        }

        let now = Instant::now();
        self.peers.insert(
            peer_id.clone(),
            PeerRecord {
                connection: id,
                registered_at: now,
                last_seen: now,
            },
        );
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.peer_id = Some(peer_id.clone());
        }

        info!(%peer_id, connection = id, peers = self.peers.len(), "peer registered");

        self.send_snapshot(id, &peer_id);
        self.broadcast(&Envelope::PeerJoined { peer_id }, Some(id));
    }

    /// Forward an opaque signal from connection `id` to `target`
    pub fn forward_signal(
        &mut self,
        id: ConnectionId,
        target: &PeerId,
        signal: serde_json::Value,
    ) -> ForwardOutcome {
        let limit = self.signal_limit;
        let Some(conn) = self.connections.get_mut(&id) else {
            return ForwardOutcome::SenderUnregistered;
        };
        let Some(from) = conn.peer_id.clone() else {
            return ForwardOutcome::SenderUnregistered;
        };
        if !conn.signals.check(limit, Duration::from_secs(1)) {
            return ForwardOutcome::RateLimited;
        }

        let Some(record) = self.peers.get(target) else {
            return ForwardOutcome::UnknownTarget;
        };
        let Some(dest) = self.connections.get(&record.connection) else {
            return ForwardOutcome::TargetClosed;
        };

        match Envelope::signal_from(from, signal).encode() {
            Ok(text) => {
                if dest.send(Outbound::Text(text)) {
                    ForwardOutcome::Forwarded
                } else {
                    ForwardOutcome::TargetClosed
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to encode forwarded signal");
                ForwardOutcome::TargetClosed
            }
        }
    }

    /// Send one envelope to connection `id`
    pub fn reply(&self, id: ConnectionId, envelope: &Envelope) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };

        match envelope.encode() {
            Ok(text) => {
                conn.send(Outbound::Text(text));
            }
            Err(e) => warn!(error = %e, "failed to encode reply"),
        }
    }

    /// Forget connection `id`
    ///
    /// If the connection still owned a peer id, the id is removed and
    /// `peer-left` is broadcast. Calling this twice is a no-op.
    pub fn disconnect(&mut self, id: ConnectionId) -> Option<PeerId> {
        let conn = self.connections.remove(&id)?;
        let peer_id = conn.peer_id?;

        if !self.unbind(&peer_id, id) {
            return None;
        }

        info!(%peer_id, connection = id, peers = self.peers.len(), "peer left");
        self.broadcast(
            &Envelope::PeerLeft {
                peer_id: peer_id.clone(),
            },
            None,
        );
        Some(peer_id)
    }

    /// Run one heartbeat round
    ///
    /// Connections that showed no activity since the previous round are
    /// closed and cleaned up. Survivors are marked not-alive and probed.
    /// Returns the reaped connection ids.
    pub fn sweep(&mut self) -> Vec<ConnectionId> {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| !conn.alive)
            .map(|(id, _)| *id)
            .collect();

        for id in &dead {
            if let Some(conn) = self.connections.get(id) {
                conn.send(Outbound::Close);
            }
            debug!(connection = id, "reaping unresponsive connection");
            self.disconnect(*id);
        }

        for conn in self.connections.values_mut() {
            conn.alive = false;
            conn.send(Outbound::Ping);
        }

        dead
    }

    /// Close every connection without announcing departures
    pub fn close_all(&mut self) {
        self.closed = true;
        for conn in self.connections.values() {
            conn.send(Outbound::Close);
        }
        self.connections.clear();
        self.peers.clear();
    }

    /// Whether [`close_all`](Self::close_all) has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of registered peer ids
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of open connections, registered or not
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Look up the record for a peer id
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Registered peer ids
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// Remove `peer_id` if it is still bound to connection `id`
    fn unbind(&mut self, peer_id: &PeerId, id: ConnectionId) -> bool {
        match self.peers.get(peer_id) {
            Some(record) if record.connection == id => {
                self.peers.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    fn send_snapshot(&self, id: ConnectionId, peer_id: &PeerId) {
        let peers = self
            .peers
            .keys()
            .filter(|p| *p != peer_id)
            .cloned()
            .collect();
        self.reply(id, &Envelope::Peers { peers });
    }

    /// Send to every registered connection except `exclude`
    fn broadcast(&self, envelope: &Envelope, exclude: Option<ConnectionId>) {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast");
                return;
            }
        };

        for record in self.peers.values() {
            if Some(record.connection) == exclude {
                continue;
            }
            if let Some(conn) = self.connections.get(&record.connection) {
                // Closed writers are skipped silently
                conn.send(Outbound::Text(text.clone()));
            }
        }
    }
}
