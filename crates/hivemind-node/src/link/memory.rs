//! In-process link transport.
//!
//! Every node attached to the same [`MemoryNetwork`] can link to every other.
//! Offers are parked in the shared hub under a random token; the answer
//! completes the pairing and both ends receive their channel.

use super::{
    LinkChannel, LinkError, LinkEvent, LinkEventSender, LinkNegotiator, LinkTransport, field,
    offer_token,
};
use async_trait::async_trait;
use dashmap::DashMap;
use hivemind_protocol::PeerId;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

struct ParkedOffer {
    initiator: PeerId,
    initiator_events: LinkEventSender,
    responder: Option<LinkEventSender>,
}

/// Shared hub for in-process links
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    offers: Arc<DashMap<String, ParkedOffer>>,
}

impl MemoryNetwork {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle attached to this hub
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
        }
    }

    /// Offers created but not yet answered
    #[must_use]
    pub fn pending_offers(&self) -> usize {
        self.offers.len()
    }
}

/// Link transport over a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

#[async_trait]
impl LinkTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: LinkEventSender,
    ) -> Result<Box<dyn LinkNegotiator>, LinkError> {
        Ok(Box::new(MemoryNegotiator {
            network: self.network.clone(),
            local: local.clone(),
            remote: remote.clone(),
            events,
            token: None,
            channel: None,
        }))
    }
}

struct MemoryNegotiator {
    network: MemoryNetwork,
    local: PeerId,
    remote: PeerId,
    events: LinkEventSender,
    token: Option<String>,
    channel: Option<Arc<MemoryChannel>>,
}

#[async_trait]
impl LinkNegotiator for MemoryNegotiator {
    async fn create_offer(&mut self) -> Result<Value, LinkError> {
        let token = offer_token();
        self.network.offers.insert(
            token.clone(),
            ParkedOffer {
                initiator: self.local.clone(),
                initiator_events: self.events.clone(),
                responder: None,
            },
        );

        let _ = self.events.send(LinkEvent::LocalCandidate(
            json!({"transport": "memory", "token": token}),
        ));
        self.token = Some(token.clone());

        Ok(json!({"transport": "memory", "token": token}))
    }

    async fn accept_offer(&mut self, offer: Value) -> Result<Value, LinkError> {
        let token = field(&offer, "token", "offer")?.to_string();

        let mut parked = self
            .network
            .offers
            .get_mut(&token)
            .ok_or_else(|| LinkError::Negotiation("unknown offer".to_string()))?;
        if parked.initiator != self.remote {
            return Err(LinkError::Negotiation(
                "offer belongs to another peer".to_string(),
            ));
        }
        parked.responder = Some(self.events.clone());
        drop(parked);

        self.token = Some(token.clone());
        Ok(json!({"transport": "memory", "token": token}))
    }

    async fn accept_answer(&mut self, answer: Value) -> Result<(), LinkError> {
        let token = field(&answer, "token", "answer")?;
        if self.token.as_deref() != Some(token) {
            return Err(LinkError::Negotiation("answer token mismatch".to_string()));
        }

        let (_, parked) = self
            .network
            .offers
            .remove(token)
            .ok_or_else(|| LinkError::Negotiation("offer withdrawn".to_string()))?;
        let responder = parked
            .responder
            .ok_or_else(|| LinkError::Negotiation("answer without responder".to_string()))?;

        let open = Arc::new(AtomicBool::new(true));
        let ours = Arc::new(MemoryChannel {
            open: Arc::clone(&open),
            local: parked.initiator_events.clone(),
            remote: responder.clone(),
        });
        let theirs = Arc::new(MemoryChannel {
            open,
            local: responder.clone(),
            remote: parked.initiator_events,
        });

        let _ = responder.send(LinkEvent::Ready(theirs));
        let _ = self.events.send(LinkEvent::Ready(ours.clone()));
        self.channel = Some(ours);
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: Value) -> Result<(), LinkError> {
        field(&candidate, "token", "candidate")?;
        trace!(local = %self.local, remote = %self.remote, "memory candidate accepted");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(token) = self.token.take() {
            self.network
                .offers
                .remove_if(&token, |_, parked| parked.initiator == self.local);
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

struct MemoryChannel {
    open: Arc<AtomicBool>,
    local: LinkEventSender,
    remote: LinkEventSender,
}

impl LinkChannel for MemoryChannel {
    fn send(&self, message: String) -> Result<(), LinkError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.remote
            .send(LinkEvent::Message(message))
            .map_err(|_| LinkError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.remote.is_closed()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.local.send(LinkEvent::Closed);
            let _ = self.remote.send(LinkEvent::Closed);
        }
    }
}
