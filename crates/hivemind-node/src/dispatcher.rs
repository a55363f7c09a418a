//! Task dispatcher.
//!
//! Each dispatch parks a oneshot sender in the pending map under a fresh
//! task id. Whoever removes the entry first owns the outcome: the result
//! handler, the timeout path, or the drop guard when the caller goes away.

use crate::error::DispatchError;
use crate::link::LinkChannel;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hivemind_protocol::{PeerId, PeerMessage, ResultMessage, TaskId, TaskResult};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// A peer with an open channel
#[derive(Clone)]
pub struct ConnectedPeer {
    /// Remote peer id
    pub peer_id: PeerId,
    /// Channel to that peer
    pub channel: Arc<dyn LinkChannel>,
}

impl std::fmt::Debug for ConnectedPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedPeer")
            .field("peer_id", &self.peer_id)
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// Successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Task id used on the wire
    pub task_id: TaskId,
    /// Peer that computed the task
    pub peer_id: PeerId,
    /// Worker outcome
    pub result: TaskResult,
    /// Time from send to result
    pub elapsed: Duration,
}

struct PendingTask {
    peer: PeerId,
    completion: oneshot::Sender<TaskResult>,
}

/// Removes the pending entry if the dispatch future is dropped early
struct PendingGuard<'a> {
    pending: &'a DashMap<TaskId, PendingTask>,
    task_id: TaskId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.task_id);
    }
}

/// Correlates outbound tasks with inbound results
pub struct TaskDispatcher {
    pending: DashMap<TaskId, PendingTask>,
    timeout: Duration,
}

impl TaskDispatcher {
    /// Create a dispatcher with the given result timeout
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Configured result timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of tasks awaiting a result
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send `payload` to one randomly chosen peer and wait for its result
    ///
    /// # Errors
    ///
    /// - `DispatchError::NoPeers` if `peers` is empty
    /// - `DispatchError::SendFailed` if the channel rejects the task
    /// - `DispatchError::Timeout` if no result arrives in time
    pub async fn dispatch(
        &self,
        peers: &[ConnectedPeer],
        payload: Vec<u8>,
    ) -> Result<TaskReport, DispatchError> {
        let target = peers
            .choose(&mut rand::thread_rng())
            .ok_or(DispatchError::NoPeers)?;

        let (tx, mut rx) = oneshot::channel();
        let task_id = self.park(target.peer_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            task_id: task_id.clone(),
        };

        let message = PeerMessage::task(task_id.clone(), payload)
            .encode()
            .map_err(DispatchError::Codec)?;

        let started = Instant::now();
        if let Err(e) = target.channel.send(message) {
            debug!(peer = %target.peer_id, %task_id, error = %e, "task send failed");
            return Err(DispatchError::SendFailed {
                peer: target.peer_id.clone(),
                reason: e.to_string(),
            });
        }
        trace!(peer = %target.peer_id, %task_id, "task sent");

        let result = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(self.expired(task_id)),
            Err(_) => {
                if self.pending.remove(&task_id).is_some() {
                    return Err(self.expired(task_id));
                }
                // A result claimed the entry as the timer fired
                match rx.await {
                    Ok(result) => result,
                    Err(_) => return Err(self.expired(task_id)),
                }
            }
        };

        Ok(TaskReport {
            task_id,
            peer_id: target.peer_id.clone(),
            result,
            elapsed: started.elapsed(),
        })
    }

    /// Deliver a result from `from`
    ///
    /// Returns `true` if it completed a pending dispatch. Results for
    /// unknown or expired task ids, or from a peer other than the one the
    /// task was sent to, are dropped.
    pub fn resolve(&self, from: &PeerId, message: ResultMessage) -> bool {
        let removed = self
            .pending
            .remove_if(&message.task_id, |_, pending| pending.peer == *from);

        match removed {
            Some((task_id, pending)) => {
                trace!(peer = %from, %task_id, "result matched");
                let _ = pending.completion.send(message.outcome);
                true
            }
            None => {
                debug!(peer = %from, task_id = %message.task_id, "dropping unmatched result");
                false
            }
        }
    }

    /// Insert a pending entry under a fresh id
    fn park(&self, peer: PeerId, completion: oneshot::Sender<TaskResult>) -> TaskId {
        let mut pending = Some(PendingTask { peer, completion });
        loop {
            let task_id = TaskId::generate();
            if let Entry::Vacant(slot) = self.pending.entry(task_id.clone()) {
                if let Some(task) = pending.take() {
                    slot.insert(task);
                }
                return task_id;
            }
        }
    }

    fn expired(&self, task_id: TaskId) -> DispatchError {
        debug!(%task_id, timeout = ?self.timeout, "task timed out");
        DispatchError::Timeout {
            task_id,
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Channel that records what was sent
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        broken: AtomicBool,
    }

    impl RecordingChannel {
        fn broken() -> Self {
            let channel = Self::default();
            channel.broken.store(true, Ordering::SeqCst);
            channel
        }

        fn sent_task_ids(&self) -> Vec<TaskId> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|raw| PeerMessage::decode(raw).unwrap().task_id().clone())
                .collect()
        }
    }

    impl LinkChannel for RecordingChannel {
        fn send(&self, message: String) -> Result<(), LinkError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(LinkError::Closed);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.broken.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    fn peer(id: &str, channel: Arc<RecordingChannel>) -> ConnectedPeer {
        ConnectedPeer {
            peer_id: PeerId::new(id),
            channel,
        }
    }

    async fn wait_for_send(channel: &RecordingChannel) -> TaskId {
        loop {
            if let Some(id) = channel.sent_task_ids().into_iter().next() {
                return id;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_no_peers_fails_immediately() {
        let dispatcher = TaskDispatcher::new(Duration::from_secs(10));
        let result = dispatcher.dispatch(&[], b"x".to_vec()).await;

        assert_eq!(result, Err(DispatchError::NoPeers));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_clears_entry() {
        let dispatcher = TaskDispatcher::new(Duration::from_secs(10));
        let channel = Arc::new(RecordingChannel::broken());

        let result = dispatcher
            .dispatch(&[peer("peer-b", channel)], b"x".to_vec())
            .await;

        assert!(matches!(result, Err(DispatchError::SendFailed { ref peer, .. }) if peer.as_str() == "peer-b"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_result_resolves_dispatch_once() {
        let dispatcher = Arc::new(TaskDispatcher::new(Duration::from_secs(10)));
        let channel = Arc::new(RecordingChannel::default());
        let peers = vec![peer("peer-b", channel.clone())];

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(&peers, b"input".to_vec()).await })
        };

        let task_id = wait_for_send(&channel).await;
        assert_eq!(dispatcher.pending_count(), 1);

        let from = PeerId::new("peer-b");
        let result = ResultMessage {
            task_id: task_id.clone(),
            outcome: TaskResult::Success(b"output".to_vec()),
        };
        assert!(dispatcher.resolve(&from, result.clone()));
        assert!(!dispatcher.resolve(&from, result));

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.task_id, task_id);
        assert_eq!(report.peer_id, from);
        assert_eq!(report.result, TaskResult::Success(b"output".to_vec()));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_result_is_not_a_dispatch_error() {
        let dispatcher = Arc::new(TaskDispatcher::new(Duration::from_secs(10)));
        let channel = Arc::new(RecordingChannel::default());
        let peers = vec![peer("peer-b", channel.clone())];

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(&peers, vec![]).await })
        };

        let task_id = wait_for_send(&channel).await;
        dispatcher.resolve(
            &PeerId::new("peer-b"),
            ResultMessage {
                task_id,
                outcome: TaskResult::Failure("out of memory".to_string()),
            },
        );

        let report = task.await.unwrap().unwrap();
        assert_eq!(
            report.result,
            TaskResult::Failure("out of memory".to_string())
        );
    }

    #[tokio::test]
    async fn test_result_from_other_peer_ignored() {
        let dispatcher = Arc::new(TaskDispatcher::new(Duration::from_secs(10)));
        let channel = Arc::new(RecordingChannel::default());
        let peers = vec![peer("peer-b", channel.clone())];

        let _task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(&peers, vec![]).await })
        };

        let task_id = wait_for_send(&channel).await;
        let spoofed = ResultMessage {
            task_id,
            outcome: TaskResult::Success(vec![]),
        };
        assert!(!dispatcher.resolve(&PeerId::new("peer-c"), spoofed));
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_result_dropped() {
        let dispatcher = TaskDispatcher::new(Duration::from_secs(10));
        let stray = ResultMessage {
            task_id: TaskId::new("task-unknown"),
            outcome: TaskResult::Success(vec![]),
        };
        assert!(!dispatcher.resolve(&PeerId::new("peer-b"), stray));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_result() {
        let dispatcher = TaskDispatcher::new(Duration::from_secs(10));
        let channel = Arc::new(RecordingChannel::default());

        let started = tokio::time::Instant::now();
        let result = dispatcher
            .dispatch(&[peer("peer-b", channel.clone())], b"x".to_vec())
            .await;

        let task_id = channel.sent_task_ids().remove(0);
        assert_eq!(
            result,
            Err(DispatchError::Timeout {
                task_id: task_id.clone(),
                timeout: Duration::from_secs(10),
            })
        );
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(dispatcher.pending_count(), 0);

        let late = ResultMessage {
            task_id,
            outcome: TaskResult::Success(vec![]),
        };
        assert!(!dispatcher.resolve(&PeerId::new("peer-b"), late));
    }

    #[tokio::test]
    async fn test_dropped_caller_clears_entry() {
        let dispatcher = Arc::new(TaskDispatcher::new(Duration::from_secs(10)));
        let channel = Arc::new(RecordingChannel::default());
        let peers = vec![peer("peer-b", channel.clone())];

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(&peers, vec![]).await })
        };

        wait_for_send(&channel).await;
        assert_eq!(dispatcher.pending_count(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_choice_covers_all_peers() {
        let dispatcher = TaskDispatcher::new(Duration::from_millis(1));
        let b = Arc::new(RecordingChannel::default());
        let c = Arc::new(RecordingChannel::default());
        let peers = vec![peer("peer-b", b.clone()), peer("peer-c", c.clone())];

        for _ in 0..64 {
            let _ = dispatcher.dispatch(&peers, vec![]).await;
        }

        assert!(!b.sent_task_ids().is_empty());
        assert!(!c.sent_task_ids().is_empty());
        assert_eq!(b.sent_task_ids().len() + c.sent_task_ids().len(), 64);
    }
}
