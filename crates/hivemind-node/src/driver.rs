//! Session driver.
//!
//! Each remote peer gets one driver task. It owns the [`PeerSession`] and the
//! link negotiator, consumes relay signals and link events in arrival order,
//! and keeps the session table in step with the session state.

use crate::error::NodeError;
use crate::event::{DisconnectReason, NodeEvent};
use crate::link::{LinkChannel, LinkEvent, LinkNegotiator, LinkTransport};
use crate::session::{NegotiationPhase, PeerSession, Role, SessionState};
use crate::table::SessionTable;
use hivemind_protocol::{NegotiationSignal, PeerId};
use hivemind_relay::SignalingClient;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Outbound path for negotiation signals
pub trait SignalSink: Send + Sync {
    /// Relay `signal` to `target`
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Signaling` if the relay connection is gone.
    fn deliver(&self, target: &PeerId, signal: &NegotiationSignal) -> Result<(), NodeError>;
}

impl SignalSink for SignalingClient {
    fn deliver(&self, target: &PeerId, signal: &NegotiationSignal) -> Result<(), NodeError> {
        let payload = signal.to_payload()?;
        self.send_signal(target, payload)?;
        Ok(())
    }
}

/// Instructions from the node to one session driver
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Negotiation signal relayed from the remote peer
    Signal(NegotiationSignal),
    /// The relay reported the remote peer left
    PeerLeft,
    /// Close the session
    Close,
}

/// Everything a driver shares with the node
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub(crate) local: PeerId,
    pub(crate) transport: Arc<dyn LinkTransport>,
    pub(crate) signals: Arc<dyn SignalSink>,
    pub(crate) table: Arc<SessionTable>,
    pub(crate) events: mpsc::UnboundedSender<NodeEvent>,
    pub(crate) inbound: mpsc::UnboundedSender<(PeerId, String)>,
    pub(crate) negotiation_timeout: Duration,
}

type Step = Result<(), DisconnectReason>;

pub(crate) struct SessionDriver {
    ctx: DriverContext,
    session: PeerSession,
    generation: u64,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    link_sender: mpsc::UnboundedSender<LinkEvent>,
    negotiator: Option<Box<dyn LinkNegotiator>>,
    channel: Option<Arc<dyn LinkChannel>>,
}

impl SessionDriver {
    pub(crate) fn new(
        ctx: DriverContext,
        session: PeerSession,
        generation: u64,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let (link_sender, link_events) = mpsc::unbounded_channel();
        Self {
            ctx,
            session,
            generation,
            commands,
            link_events,
            link_sender,
            negotiator: None,
            channel: None,
        }
    }

    /// Drive the session until it closes
    pub(crate) async fn run(mut self) {
        let reason = match self.start().await {
            Ok(()) => self.event_loop().await,
            Err(reason) => reason,
        };
        self.finish(reason).await;
    }

    async fn start(&mut self) -> Step {
        let remote = self.session.remote().clone();
        let mut negotiator = self
            .ctx
            .transport
            .open(&self.ctx.local, &remote, self.link_sender.clone())
            .await
            .map_err(|e| DisconnectReason::LinkFailed(e.to_string()))?;

        if self.session.role() == Role::Initiator {
            let offer = negotiator.create_offer().await;
            self.negotiator = Some(negotiator);
            let offer = offer.map_err(|e| DisconnectReason::NegotiationFailed(e.to_string()))?;

            self.advance(SessionState::Negotiating(NegotiationPhase::OfferSent));
            self.signal(NegotiationSignal::Offer { offer })?;
            debug!(%remote, transport = self.ctx.transport.name(), "offer sent");
        } else {
            self.negotiator = Some(negotiator);
        }
        Ok(())
    }

    async fn event_loop(&mut self) -> DisconnectReason {
        let deadline = tokio::time::sleep(self.ctx.negotiation_timeout);
        tokio::pin!(deadline);

        loop {
            let connected = self.session.state() == SessionState::Connected;
            let step = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SessionCommand::Signal(signal)) => self.on_signal(signal).await,
                    Some(SessionCommand::PeerLeft) => Err(DisconnectReason::PeerLeft),
                    Some(SessionCommand::Close) | None => Err(DisconnectReason::LocalClose),
                },
                event = self.link_events.recv() => match event {
                    Some(event) => self.on_link_event(event),
                    None => Err(DisconnectReason::ChannelClosed),
                },
                () = &mut deadline, if !connected => Err(DisconnectReason::NegotiationTimeout),
            };

            if let Err(reason) = step {
                return reason;
            }
        }
    }

    async fn on_signal(&mut self, signal: NegotiationSignal) -> Step {
        let remote = self.session.remote().clone();
        let state = self.session.state();
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Ok(());
        };

        match signal {
            NegotiationSignal::Offer { offer } => {
                if self.session.role() != Role::Responder || state != SessionState::New {
                    debug!(%remote, ?state, "ignoring unexpected offer");
                    return Ok(());
                }
                let answer = negotiator
                    .accept_offer(offer)
                    .await
                    .map_err(|e| DisconnectReason::NegotiationFailed(e.to_string()))?;

                self.advance(SessionState::Negotiating(NegotiationPhase::AnswerSent));
                self.signal(NegotiationSignal::Answer { answer })?;
                debug!(%remote, "answer sent");
                self.flush_candidates().await;
            }
            NegotiationSignal::Answer { answer } => {
                if state != SessionState::Negotiating(NegotiationPhase::OfferSent) {
                    debug!(%remote, ?state, "ignoring unexpected answer");
                    return Ok(());
                }
                negotiator
                    .accept_answer(answer)
                    .await
                    .map_err(|e| DisconnectReason::NegotiationFailed(e.to_string()))?;

                self.advance(SessionState::Negotiating(NegotiationPhase::AnswerReceived));
                self.flush_candidates().await;
            }
            NegotiationSignal::IceCandidate { candidate } => {
                if let Some(candidate) = self.session.accept_candidate(candidate) {
                    self.apply_candidate(candidate).await;
                } else {
                    trace!(%remote, buffered = self.session.buffered_candidates(), "candidate buffered");
                }
            }
        }
        Ok(())
    }

    fn on_link_event(&mut self, event: LinkEvent) -> Step {
        let remote = self.session.remote().clone();

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if self.session.state() == SessionState::Connected {
                    return Ok(());
                }
                self.signal(NegotiationSignal::IceCandidate { candidate })
            }
            LinkEvent::Ready(channel) => {
                if !self.session.can_transition(SessionState::Connected) {
                    debug!(%remote, state = ?self.session.state(), "ignoring channel ready");
                    return Ok(());
                }
                self.advance(SessionState::Connected);
                self.ctx
                    .table
                    .mark_connected(&remote, self.generation, Arc::clone(&channel));
                self.channel = Some(channel);

                info!(%remote, role = ?self.session.role(), "peer connected");
                let _ = self.ctx.events.send(NodeEvent::PeerConnected(remote));
                Ok(())
            }
            LinkEvent::Message(text) => {
                let _ = self.ctx.inbound.send((remote, text));
                Ok(())
            }
            LinkEvent::Closed => Err(DisconnectReason::ChannelClosed),
            LinkEvent::Failed(error) => Err(DisconnectReason::LinkFailed(error)),
        }
    }

    /// Apply candidates that arrived before the remote description
    async fn flush_candidates(&mut self) {
        for candidate in self.session.remote_description_applied() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: Value) {
        if let Some(negotiator) = self.negotiator.as_mut() {
            if let Err(e) = negotiator.add_candidate(candidate).await {
                debug!(remote = %self.session.remote(), error = %e, "candidate rejected");
            }
        }
    }

    fn advance(&mut self, to: SessionState) {
        match self.session.transition_to(to) {
            Ok(_) => self
                .ctx
                .table
                .set_state(self.session.remote(), self.generation, to),
            Err(e) => debug!(remote = %self.session.remote(), error = %e, "transition rejected"),
        }
    }

    fn signal(&self, signal: NegotiationSignal) -> Step {
        self.ctx
            .signals
            .deliver(self.session.remote(), &signal)
            .map_err(|e| DisconnectReason::NegotiationFailed(e.to_string()))
    }

    async fn finish(mut self, reason: DisconnectReason) {
        let remote = self.session.remote().clone();
        let from = self.session.state();
        let _ = self.session.transition_to(SessionState::Closed);

        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.close().await;
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.ctx.table.remove(&remote, self.generation);

        let quiet = matches!(
            reason,
            DisconnectReason::LocalClose | DisconnectReason::PeerLeft
        );
        match from {
            SessionState::New if quiet => {
                debug!(%remote, %reason, "session closed before negotiation");
            }
            SessionState::New => {
                debug!(%remote, %reason, "negotiation failed");
                let _ = self.ctx.events.send(NodeEvent::NegotiationFailed {
                    peer_id: remote,
                    reason,
                });
            }
            _ => {
                info!(%remote, %reason, "peer disconnected");
                let _ = self.ctx.events.send(NodeEvent::PeerDisconnected {
                    peer_id: remote,
                    reason,
                });
            }
        }
    }
}
