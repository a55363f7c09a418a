//! Direct links over TCP.
//!
//! The initiator parks its offer token with the local listener and
//! advertises the listener address as a candidate. The responder dials the
//! candidate, presents the token in a hello line, and waits for the ack.
//! After that each line on the socket is one peer message.

use super::{
    LinkChannel, LinkError, LinkEvent, LinkEventSender, LinkNegotiator, LinkTransport, field,
    offer_token,
};
use crate::config::LinkConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use hivemind_protocol::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

type LineReader = Lines<BufReader<OwnedReadHalf>>;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    token: String,
    #[serde(rename = "peerId")]
    peer_id: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
struct Ack {
    ok: bool,
}

struct ParkedOffer {
    remote: PeerId,
    events: LinkEventSender,
}

struct TcpInner {
    advertised: SocketAddr,
    offers: DashMap<String, ParkedOffer>,
    handshake_timeout: Duration,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for TcpInner {
    fn drop(&mut self) {
        if let Ok(mut task) = self.accept_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Link transport over plain TCP
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Bind the link listener
    ///
    /// An unspecified listen IP is advertised as loopback.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Io` if the listener cannot be bound.
    pub async fn bind(config: &LinkConfig) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local = listener.local_addr()?;
        let advertised = advertised_addr(local);

        let inner = Arc::new(TcpInner {
            advertised,
            offers: DashMap::new(),
            handshake_timeout: config.handshake_timeout,
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&inner)));
        if let Ok(mut slot) = inner.accept_task.lock() {
            *slot = Some(task);
        }

        info!(%local, %advertised, "tcp link listener bound");
        Ok(Self { inner })
    }

    /// Address advertised to remote peers
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.advertised
    }
}

fn advertised_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

async fn accept_loop(listener: TcpListener, inner: Weak<TcpInner>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "tcp link accept failed");
                continue;
            }
        };
        let Some(shared) = inner.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = accept_link(&shared, stream).await {
                debug!(%addr, error = %e, "rejected inbound link");
            }
        });
    }
}

/// Match an inbound connection to a parked offer
async fn accept_link(inner: &TcpInner, stream: TcpStream) -> Result<(), LinkError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let line = tokio::time::timeout(inner.handshake_timeout, lines.next_line())
        .await
        .map_err(|_| LinkError::Io("handshake timed out".to_string()))??
        .ok_or(LinkError::Closed)?;
    let hello: Hello =
        serde_json::from_str(&line).map_err(|_| LinkError::InvalidDescription("hello"))?;

    let (_, parked) = inner
        .offers
        .remove_if(&hello.token, |_, parked| parked.remote == hello.peer_id)
        .ok_or_else(|| LinkError::Negotiation("unknown offer token".to_string()))?;

    let ack = encode_line(&Ack { ok: true })?;
    write.write_all(ack.as_bytes()).await?;

    trace!(remote = %hello.peer_id, "inbound link accepted");
    TcpChannel::start(lines, write, parked.events);
    Ok(())
}

#[async_trait]
impl LinkTransport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: LinkEventSender,
    ) -> Result<Box<dyn LinkNegotiator>, LinkError> {
        Ok(Box::new(TcpNegotiator {
            inner: Arc::clone(&self.inner),
            local: local.clone(),
            remote: remote.clone(),
            events,
            token: None,
            offered: false,
            linked: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct TcpNegotiator {
    inner: Arc<TcpInner>,
    local: PeerId,
    remote: PeerId,
    events: LinkEventSender,
    token: Option<String>,
    offered: bool,
    linked: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl LinkNegotiator for TcpNegotiator {
    async fn create_offer(&mut self) -> Result<Value, LinkError> {
        let token = offer_token();
        self.inner.offers.insert(
            token.clone(),
            ParkedOffer {
                remote: self.remote.clone(),
                events: self.events.clone(),
            },
        );
        self.token = Some(token.clone());
        self.offered = true;

        let _ = self.events.send(LinkEvent::LocalCandidate(
            json!({"address": self.inner.advertised.to_string()}),
        ));
        Ok(json!({"transport": "tcp", "token": token}))
    }

    async fn accept_offer(&mut self, offer: Value) -> Result<Value, LinkError> {
        let token = field(&offer, "token", "offer")?.to_string();
        self.token = Some(token.clone());
        Ok(json!({"transport": "tcp", "token": token}))
    }

    async fn accept_answer(&mut self, answer: Value) -> Result<(), LinkError> {
        let token = field(&answer, "token", "answer")?;
        if self.token.as_deref() != Some(token) {
            return Err(LinkError::Negotiation("answer token mismatch".to_string()));
        }
        // The responder dials us; readiness arrives from the accept loop
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: Value) -> Result<(), LinkError> {
        let addr: SocketAddr = field(&candidate, "address", "candidate")?
            .parse()
            .map_err(|_| LinkError::InvalidDescription("candidate"))?;

        if self.offered || self.linked.load(Ordering::Acquire) {
            return Ok(());
        }
        let token = self
            .token
            .clone()
            .ok_or_else(|| LinkError::Negotiation("candidate before offer".to_string()))?;

        tokio::spawn(dial(
            addr,
            Hello {
                token,
                peer_id: self.local.clone(),
            },
            self.events.clone(),
            Arc::clone(&self.linked),
            Arc::clone(&self.closed),
            self.inner.handshake_timeout,
        ));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(token) = self.token.take() {
            if self.offered {
                self.inner.offers.remove(&token);
            }
        }
    }
}

/// Dial one candidate address and complete the hello/ack exchange
async fn dial(
    addr: SocketAddr,
    hello: Hello,
    events: LinkEventSender,
    linked: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    handshake_timeout: Duration,
) {
    let attempt = async {
        let stream = tokio::time::timeout(handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::Io("connect timed out".to_string()))??;
        let (read, mut write) = stream.into_split();

        write.write_all(encode_line(&hello)?.as_bytes()).await?;

        let mut lines = BufReader::new(read).lines();
        let line = tokio::time::timeout(handshake_timeout, lines.next_line())
            .await
            .map_err(|_| LinkError::Io("handshake timed out".to_string()))??
            .ok_or(LinkError::Closed)?;
        let ack: Ack =
            serde_json::from_str(&line).map_err(|_| LinkError::InvalidDescription("ack"))?;
        if !ack.ok {
            return Err(LinkError::Negotiation("link refused".to_string()));
        }
        Ok::<_, LinkError>((lines, write))
    };

    match attempt.await {
        Ok((lines, write)) => {
            if closed.load(Ordering::Acquire) || linked.swap(true, Ordering::AcqRel) {
                return;
            }
            TcpChannel::start(lines, write, events);
        }
        Err(e) => debug!(%addr, error = %e, "candidate dial failed"),
    }
}

fn encode_line<T: Serialize>(value: &T) -> Result<String, LinkError> {
    let mut line =
        serde_json::to_string(value).map_err(|e| LinkError::Negotiation(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

struct TcpChannel {
    outbound: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    events: LinkEventSender,
}

impl TcpChannel {
    /// Report the channel ready, then start its I/O tasks
    ///
    /// No `Message` for this channel can be queued ahead of its `Ready`.
    fn start(lines: LineReader, write: OwnedWriteHalf, events: LinkEventSender) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let open = Arc::new(AtomicBool::new(true));

        let channel = Arc::new(Self {
            outbound,
            open: Arc::clone(&open),
            shutdown,
            events: events.clone(),
        });
        let _ = events.send(LinkEvent::Ready(channel));

        tokio::spawn(read_loop(
            lines,
            events.clone(),
            Arc::clone(&open),
            shutdown_rx.clone(),
        ));
        tokio::spawn(write_loop(write, rx, events, open, shutdown_rx));
    }
}

impl LinkChannel for TcpChannel {
    fn send(&self, message: String) -> Result<(), LinkError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.outbound.send(message).map_err(|_| LinkError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.shutdown.send_replace(true);
            let _ = self.events.send(LinkEvent::Closed);
        }
    }
}

async fn read_loop(
    mut lines: LineReader,
    events: LinkEventSender,
    open: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let _ = events.send(LinkEvent::Message(line));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "link read failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    if open.swap(false, Ordering::AcqRel) {
        let _ = events.send(LinkEvent::Closed);
    }
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: LinkEventSender,
    open: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(mut message) = message else { break };
                message.push('\n');
                if let Err(e) = write.write_all(message.as_bytes()).await {
                    debug!(error = %e, "link write failed");
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let _ = write.shutdown().await;
    if open.swap(false, Ordering::AcqRel) {
        let _ = events.send(LinkEvent::Closed);
    }
}
