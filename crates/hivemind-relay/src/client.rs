//! Signaling client for connecting nodes to the relay.

use crate::error::RelayError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hivemind_protocol::{Direction, Envelope, PeerId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling client configuration
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay WebSocket URL (`ws://` or `wss://`)
    pub relay_url: String,
    /// Interval between application-level pings
    pub ping_interval: Duration,
    /// Time allowed to establish the WebSocket connection
    pub connect_timeout: Duration,
}

impl SignalingConfig {
    /// Configuration for `relay_url` with default timings
    #[must_use]
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }

    /// Parse and check the relay URL
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidUrl` unless the URL uses `ws` or `wss`.
    pub fn parsed_url(&self) -> Result<Url, RelayError> {
        let url = Url::parse(&self.relay_url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(RelayError::InvalidUrl(format!(
                "unsupported scheme '{other}', expected ws or wss"
            ))),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: format!("ws://127.0.0.1:{}", hivemind_protocol::DEFAULT_RELAY_PORT),
            ping_interval: crate::CLIENT_PING_INTERVAL,
            connect_timeout: crate::RELAY_CONNECT_TIMEOUT,
        }
    }
}

/// Signaling client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Disconnected from relay
    Disconnected,
    /// Connecting to relay
    Connecting,
    /// Register sent, waiting for the membership snapshot
    Registering,
    /// Registered with the relay
    Connected,
}

/// Notifications delivered by the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Membership snapshot received after registering
    Peers(Vec<PeerId>),
    /// Another peer registered
    PeerJoined(PeerId),
    /// A peer disconnected or was reaped
    PeerLeft(PeerId),
    /// Negotiation payload from another peer
    Signal {
        /// Originating peer
        from: PeerId,
        /// Opaque payload
        payload: Value,
    },
    /// Connection to the relay ended
    Disconnected,
}

/// WebSocket connection to the signaling relay
pub struct SignalingClient {
    peer_id: PeerId,
    relay_url: Url,
    outbound: mpsc::UnboundedSender<Envelope>,
    state: Arc<Mutex<SignalingState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to the relay and register `peer_id`
    ///
    /// Returns the client and the stream of relay events. The membership
    /// snapshot arrives as the first [`RelayEvent::Peers`].
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid, the connection fails or times
    /// out, or the register message cannot be sent.
    pub async fn connect(
        config: SignalingConfig,
        peer_id: PeerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), RelayError> {
        let relay_url = config.parsed_url()?;
        let state = Arc::new(Mutex::new(SignalingState::Connecting));

        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect_async(relay_url.as_str()))
            .await
            .map_err(|_| RelayError::Timeout)??;
        let (mut sink, source) = ws.split();

        let register = Envelope::register(peer_id.clone()).encode()?;
        sink.send(Message::Text(register.into())).await?;
        *state.lock().await = SignalingState::Registering;
        debug!(%peer_id, url = %relay_url, "registering with relay");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_connection(
            sink,
            source,
            outbound_rx,
            events_tx,
            Arc::clone(&state),
            shutdown_rx,
            config.ping_interval,
        ));

        let client = Self {
            peer_id,
            relay_url,
            outbound,
            state,
            shutdown,
            task: Mutex::new(Some(task)),
        };

        Ok((client, events_rx))
    }

    /// Forward a negotiation payload to `target` through the relay
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotConnected` if the connection has ended.
    pub fn send_signal(&self, target: &PeerId, payload: Value) -> Result<(), RelayError> {
        self.outbound
            .send(Envelope::signal_to(target.clone(), payload))
            .map_err(|_| RelayError::NotConnected)
    }

    /// Close the connection and stop the ping task
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);

        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        *self.state.lock().await = SignalingState::Disconnected;
    }

    /// Get current client state
    pub async fn state(&self) -> SignalingState {
        *self.state.lock().await
    }

    /// Local peer id this client registered
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Relay URL this client connected to
    #[must_use]
    pub fn relay_url(&self) -> &Url {
        &self.relay_url
    }
}

/// Pump frames between the WebSocket and the client handles
async fn run_connection(
    mut sink: SplitSink<WsStream, Message>,
    mut source: SplitStream<WsStream>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<RelayEvent>,
    state: Arc<Mutex<SignalingState>>,
    mut shutdown: watch::Receiver<bool>,
    ping_interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                match envelope.encode() {
                    Ok(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            debug!(error = %e, "relay send failed");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode envelope"),
                }
            }
            _ = ticker.tick() => {
                let Ok(ping) = Envelope::Ping.encode() else { continue };
                if sink.send(Message::Text(ping.into())).await.is_err() {
                    break;
                }
                trace!("sent relay ping");
            }
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_text(&text, &events, &state).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "relay connection error");
                    break;
                }
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    *state.lock().await = SignalingState::Disconnected;
    info!("disconnected from relay");
    let _ = events.send(RelayEvent::Disconnected);
}

/// Translate one relay frame into an event
async fn handle_text(
    text: &str,
    events: &mpsc::UnboundedSender<RelayEvent>,
    state: &Mutex<SignalingState>,
) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "dropping malformed relay message");
            return;
        }
    };
    if let Err(e) = envelope.validate(Direction::FromRelay) {
        debug!(error = %e, "dropping invalid relay message");
        return;
    }

    let event = match envelope {
        Envelope::Peers { peers } => {
            *state.lock().await = SignalingState::Connected;
            RelayEvent::Peers(peers)
        }
        Envelope::PeerJoined { peer_id } => RelayEvent::PeerJoined(peer_id),
        Envelope::PeerLeft { peer_id } => RelayEvent::PeerLeft(peer_id),
        Envelope::Signal {
            from_peer_id: Some(from),
            signal,
            ..
        } => RelayEvent::Signal {
            from,
            payload: signal,
        },
        Envelope::Pong => {
            trace!("relay pong");
            return;
        }
        _ => return,
    };

    let _ = events.send(event);
}
