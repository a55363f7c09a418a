//! WebSocket relay server.

use crate::error::RelayError;
use crate::registry::{ConnectionId, ForwardOutcome, Outbound, Registry};
use futures::{SinkExt, StreamExt};
use hivemind_protocol::{Direction, Envelope};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Signals forwarded per connection per second
    pub signal_rate_limit: usize,
    /// Interval between heartbeat rounds
    pub heartbeat_interval: Duration,
    /// Time allowed for the WebSocket upgrade
    pub handshake_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            signal_rate_limit: 100,
            heartbeat_interval: crate::HEARTBEAT_INTERVAL,
            handshake_timeout: crate::RELAY_CONNECT_TIMEOUT,
        }
    }
}

/// Signaling relay
///
/// Accepts WebSocket connections, maintains the peer registry, forwards
/// negotiation signals, and reaps connections that stop answering.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<RwLock<Registry>>,
    config: RelayServerConfig,
    next_connection: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a new relay server
    ///
    /// # Arguments
    ///
    /// * `bind_addr` - Address to bind the server to
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, RelayError> {
        Self::bind_with_config(bind_addr, RelayServerConfig::default()).await
    }

    /// Create a new relay server with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: RelayServerConfig,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(RwLock::new(Registry::new(config.signal_rate_limit))),
            config,
            next_connection: Arc::new(AtomicU64::new(1)),
            shutdown,
        })
    }

    /// Address the server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the relay server
    ///
    /// Accepts connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Shutdown` if the server was already shut down.
    pub async fn run(&self) -> Result<(), RelayError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Err(RelayError::Shutdown);
        }

        info!(addr = %self.local_addr, "relay server listening");
        self.spawn_heartbeat_task();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr).await,
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        info!(addr = %self.local_addr, "relay server stopped");
        Ok(())
    }

    /// Stop accepting connections and close every open connection
    ///
    /// Connections are closed without `peer-left` announcements.
    pub async fn shutdown(&self) {
        self.registry.write().await.close_all();
        self.shutdown.send_replace(true);
    }

    /// Number of registered peer ids
    pub async fn peer_count(&self) -> usize {
        self.registry.read().await.peer_count()
    }

    /// Number of open connections, registered or not
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connection_count()
    }

    async fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if self.registry.read().await.connection_count() >= self.config.max_connections {
            warn!(%addr, "relay at capacity, refusing connection");
            return;
        }

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.subscribe();
        let handshake_timeout = self.config.handshake_timeout;

        tokio::spawn(async move {
            if let Err(e) =
                serve_connection(stream, addr, id, registry, shutdown, handshake_timeout).await
            {
                debug!(connection = id, %addr, error = %e, "connection ended with error");
            }
        });
    }

    /// Spawn the heartbeat task that reaps silent connections
    fn spawn_heartbeat_task(&self) {
        let registry = Arc::clone(&self.registry);
        let interval = self.config.heartbeat_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = registry.write().await.sweep();
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "reaped unresponsive connections");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

/// Drive one client connection until it closes
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    registry: Arc<RwLock<Registry>>,
    mut shutdown: watch::Receiver<bool>,
    handshake_timeout: Duration,
) -> Result<(), RelayError> {
    let ws = tokio::time::timeout(handshake_timeout, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| RelayError::Timeout)??;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    if !registry.write().await.add_connection(id, tx) {
        let _ = sink.send(Message::Close(None)).await;
        return Err(RelayError::Shutdown);
    }
    debug!(connection = id, %addr, "connection opened");

    let result: Result<(), RelayError> = loop {
        tokio::select! {
            outbound = rx.recv() => {
                let frame = match outbound {
                    Some(Outbound::Text(text)) => Message::Text(text.into()),
                    Some(Outbound::Ping) => Message::Ping(Default::default()),
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break Ok(());
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    break Err(e.into());
                }
            }
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let mut registry = registry.write().await;
                    registry.touch(id);
                    process_text(&mut registry, id, &text);
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(Message::Binary(_))) => {
                    registry.write().await.touch(id);
                    debug!(connection = id, "ignoring binary frame");
                }
                Some(Ok(_)) => registry.write().await.touch(id),
                Some(Err(e)) => break Err(e.into()),
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    if let Some(peer_id) = registry.write().await.disconnect(id) {
        debug!(connection = id, %peer_id, "connection closed");
    }
    result
}

/// Handle one text frame from connection `id`
fn process_text(registry: &mut Registry, id: ConnectionId, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(connection = id, error = %e, "dropping malformed envelope");
            return;
        }
    };
    if let Err(e) = envelope.validate(Direction::ToRelay) {
        debug!(connection = id, error = %e, "dropping invalid envelope");
        return;
    }

    match envelope {
        Envelope::Register { peer_id } => registry.register(id, peer_id),
        Envelope::Signal {
            target_peer_id: Some(target),
            signal,
            ..
        } => {
            let outcome = registry.forward_signal(id, &target, signal);
            if outcome != ForwardOutcome::Forwarded {
                debug!(connection = id, %target, ?outcome, "signal dropped");
            } else {
                trace!(connection = id, %target, "signal forwarded");
            }
        }
        Envelope::Ping => registry.reply(id, &Envelope::Pong),
        other => error!(
            connection = id,
            kind = other.message_type(),
            "validated envelope has no handler"
        ),
    }
}
