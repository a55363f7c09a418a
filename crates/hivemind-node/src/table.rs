//! Session table.
//!
//! One entry per remote peer id, owned by the driver task that negotiates
//! it. Every entry carries a generation number so a driver that finished
//! late never removes or updates the entry of a newer session for the same
//! peer.

use crate::dispatcher::ConnectedPeer;
use crate::driver::SessionCommand;
use crate::link::LinkChannel;
use crate::session::{Role, SessionState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hivemind_protocol::PeerId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

pub(crate) struct SessionEntry {
    generation: u64,
    role: Role,
    state: SessionState,
    commands: mpsc::UnboundedSender<SessionCommand>,
    channel: Option<Arc<dyn LinkChannel>>,
}

/// Live sessions keyed by remote peer id
#[derive(Default)]
pub(crate) struct SessionTable {
    entries: DashMap<PeerId, SessionEntry>,
    next_generation: AtomicU64,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry unless one exists; returns its generation
    pub(crate) fn insert_if_absent(
        &self,
        remote: &PeerId,
        role: Role,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Option<u64> {
        match self.entries.entry(remote.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(SessionEntry {
                    generation,
                    role,
                    state: SessionState::New,
                    commands,
                    channel: None,
                });
                Some(generation)
            }
        }
    }

    /// Queue a command for the session's driver
    ///
    /// Returns `false` if no session exists or its driver is gone.
    pub(crate) fn send(&self, remote: &PeerId, command: SessionCommand) -> bool {
        self.entries
            .get(remote)
            .is_some_and(|entry| entry.commands.send(command).is_ok())
    }

    pub(crate) fn set_state(&self, remote: &PeerId, generation: u64, state: SessionState) {
        if let Some(mut entry) = self.entries.get_mut(remote) {
            if entry.generation == generation {
                entry.state = state;
            }
        }
    }

    pub(crate) fn mark_connected(
        &self,
        remote: &PeerId,
        generation: u64,
        channel: Arc<dyn LinkChannel>,
    ) {
        if let Some(mut entry) = self.entries.get_mut(remote) {
            if entry.generation == generation {
                entry.state = SessionState::Connected;
                entry.channel = Some(channel);
            }
        }
    }

    /// Remove the entry if it still belongs to `generation`
    pub(crate) fn remove(&self, remote: &PeerId, generation: u64) -> bool {
        self.entries
            .remove_if(remote, |_, entry| entry.generation == generation)
            .is_some()
    }

    /// Peers whose channel is open, in no particular order
    pub(crate) fn connected_peers(&self) -> Vec<ConnectedPeer> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let channel = entry.channel.as_ref()?;
                (entry.state == SessionState::Connected && channel.is_open()).then(|| {
                    ConnectedPeer {
                        peer_id: entry.key().clone(),
                        channel: Arc::clone(channel),
                    }
                })
            })
            .collect()
    }

    /// Open channel to `remote`, if any
    pub(crate) fn channel(&self, remote: &PeerId) -> Option<Arc<dyn LinkChannel>> {
        let entry = self.entries.get(remote)?;
        entry.channel.as_ref().filter(|c| c.is_open()).cloned()
    }

    pub(crate) fn state(&self, remote: &PeerId) -> Option<SessionState> {
        self.entries.get(remote).map(|entry| entry.state)
    }

    pub(crate) fn role(&self, remote: &PeerId) -> Option<Role> {
        self.entries.get(remote).map(|entry| entry.role)
    }

    /// Remove every entry, returning their command senders and channels
    pub(crate) fn drain(
        &self,
    ) -> Vec<(
        mpsc::UnboundedSender<SessionCommand>,
        Option<Arc<dyn LinkChannel>>,
    )> {
        let remotes: Vec<PeerId> = self.entries.iter().map(|e| e.key().clone()).collect();
        remotes
            .into_iter()
            .filter_map(|remote| self.entries.remove(&remote))
            .map(|(_, entry)| (entry.commands, entry.channel))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
