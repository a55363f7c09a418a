//! End-to-end tests for the compute swarm.
//!
//! Every test runs a real relay on loopback and real nodes. Direct links use
//! the in-process memory transport except where the TCP transport is under
//! test.

use async_trait::async_trait;
use hivemind_integration_tests::fixtures::swarm::wait_until;
use hivemind_integration_tests::fixtures::{SwarmFixture, SwarmNode};
use hivemind_node::link::TcpTransport;
use hivemind_node::{
    ComputeWorker, DenseLayerRequest, DenseLayerResponse, DenseLayerWorker, DisconnectReason,
    DispatchError, EchoWorker, LinkConfig, NodeEvent, Role, SessionState, WorkerError,
};
use hivemind_protocol::{PeerId, TaskResult};
use std::sync::Arc;
use std::time::Duration;

/// Always fails
struct FailingWorker;

#[async_trait]
impl ComputeWorker for FailingWorker {
    async fn process(&self, _input: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
        Err(WorkerError::Failed("out of memory".to_string()))
    }
}

/// Never answers
struct SilentWorker;

#[async_trait]
impl ComputeWorker for SilentWorker {
    async fn process(&self, _input: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
        std::future::pending().await
    }
}

/// Start two nodes and wait until both ends of their link are open
async fn connected_pair(
    swarm: &SwarmFixture,
    a_worker: Arc<dyn ComputeWorker>,
    b_worker: Arc<dyn ComputeWorker>,
) -> (SwarmNode, SwarmNode) {
    let mut a = swarm.spawn_node("peer-a", a_worker).await.unwrap();
    let mut b = swarm.spawn_node("peer-b", b_worker).await.unwrap();

    a.wait_connected(&PeerId::new("peer-b")).await;
    b.wait_connected(&PeerId::new("peer-a")).await;
    (a, b)
}

// ============================================================================
// Session establishment
// ============================================================================

#[tokio::test]
async fn test_two_nodes_connect() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (a, b) = connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(EchoWorker)).await;

    let peer_a = PeerId::new("peer-a");
    let peer_b = PeerId::new("peer-b");
    assert_eq!(a.node.connected_peers(), vec![peer_b.clone()]);
    assert_eq!(b.node.connected_peers(), vec![peer_a.clone()]);

    // The newer member initiates
    assert_eq!(b.node.session_role(&peer_a), Some(Role::Initiator));
    assert_eq!(a.node.session_role(&peer_b), Some(Role::Responder));
    assert_eq!(a.node.session_state(&peer_b), Some(SessionState::Connected));

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_three_nodes_form_full_mesh() {
    let swarm = SwarmFixture::new().await.unwrap();
    let mut nodes = Vec::new();
    for name in ["peer-a", "peer-b", "peer-c"] {
        nodes.push(swarm.spawn_node(name, Arc::new(EchoWorker)).await.unwrap());
    }

    for node in &nodes {
        let node = node.node.clone();
        assert!(wait_until(|| {
            let node = node.clone();
            async move { node.connected_peers().len() == 2 }
        })
        .await);
    }

    swarm.shutdown().await;
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_end_to_end_dispatch() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (mut a, mut b) = connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(EchoWorker)).await;

    let report = a.node.dispatch(b"input bytes".to_vec()).await.unwrap();

    assert_eq!(report.peer_id, PeerId::new("peer-b"));
    assert_eq!(report.result, TaskResult::Success(b"input bytes".to_vec()));
    assert_eq!(a.node.pending_tasks(), 0);

    let served = b
        .wait_for(|e| matches!(e, NodeEvent::TaskServed { .. }))
        .await
        .unwrap();
    assert_eq!(
        served,
        NodeEvent::TaskServed {
            peer_id: PeerId::new("peer-a"),
            task_id: report.task_id.clone(),
            success: true,
        }
    );

    let received = a
        .wait_for(|e| matches!(e, NodeEvent::ResultReceived { .. }))
        .await
        .unwrap();
    assert_eq!(
        received,
        NodeEvent::ResultReceived {
            peer_id: PeerId::new("peer-b"),
            task_id: report.task_id,
        }
    );

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_dense_layer_dispatch() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (a, _b) =
        connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(DenseLayerWorker)).await;

    let request = DenseLayerRequest {
        input: vec![1.0, 0.5],
        weights: vec![1.0, 1.0, -1.0, 2.0, 0.0, 0.0],
        bias: vec![0.0, 0.5, 0.25],
    };
    let payload = serde_json::to_vec(&request).unwrap();

    let report = a.node.dispatch(payload).await.unwrap();
    let TaskResult::Success(bytes) = report.result else {
        panic!("dense layer task failed: {:?}", report.result);
    };
    let response: DenseLayerResponse = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(response.output, vec![1.5, 0.5, 0.25]);
    assert_eq!(response.prediction, 0);

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_worker_failure_is_reported_as_result() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (a, mut b) = connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(FailingWorker)).await;

    let report = a.node.dispatch(b"x".to_vec()).await.unwrap();
    assert_eq!(
        report.result,
        TaskResult::Failure("computation failed: out of memory".to_string())
    );

    let served = b
        .wait_for(|e| matches!(e, NodeEvent::TaskServed { .. }))
        .await
        .unwrap();
    assert!(matches!(served, NodeEvent::TaskServed { success: false, .. }));

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_without_peers_fails_immediately() {
    let swarm = SwarmFixture::new().await.unwrap();
    let a = swarm.spawn_node("peer-a", Arc::new(EchoWorker)).await.unwrap();

    assert_eq!(
        a.node.dispatch(b"x".to_vec()).await,
        Err(DispatchError::NoPeers)
    );

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let swarm = SwarmFixture::new().await.unwrap();
    let mut config = swarm.node_config();
    config.dispatch_timeout = Duration::from_millis(300);

    let mut a = swarm
        .spawn_node_with(
            "peer-a",
            config,
            Arc::new(swarm.network.transport()),
            Arc::new(EchoWorker),
        )
        .await
        .unwrap();
    let mut b = swarm.spawn_node("peer-b", Arc::new(SilentWorker)).await.unwrap();
    a.wait_connected(b.node.peer_id()).await;
    b.wait_connected(a.node.peer_id()).await;

    let started = tokio::time::Instant::now();
    let result = a.node.dispatch(b"x".to_vec()).await;

    assert!(matches!(
        result,
        Err(DispatchError::Timeout { timeout, .. }) if timeout == Duration::from_millis(300)
    ));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(a.node.pending_tasks(), 0);

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_survives_relay_shutdown() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (mut a, _b) = connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(EchoWorker)).await;

    swarm.shutdown().await;
    assert_eq!(
        a.wait_for(|e| matches!(e, NodeEvent::RelayDisconnected)).await,
        Some(NodeEvent::RelayDisconnected)
    );

    // Tasks travel over the direct link only
    let report = a.node.dispatch(b"still here".to_vec()).await.unwrap();
    assert_eq!(report.result, TaskResult::Success(b"still here".to_vec()));
}

// ============================================================================
// Session teardown
// ============================================================================

#[tokio::test]
async fn test_stopped_peer_is_disconnected() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (mut a, b) = connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(EchoWorker)).await;

    b.node.stop().await.unwrap();

    let event = a.wait_disconnected(&PeerId::new("peer-b")).await.unwrap();
    let NodeEvent::PeerDisconnected { reason, .. } = event else {
        unreachable!();
    };
    assert!(matches!(
        reason,
        DisconnectReason::ChannelClosed | DisconnectReason::PeerLeft
    ));

    assert!(a.node.connected_peers().is_empty());
    assert!(wait_until(|| {
        let relay = Arc::clone(&swarm.relay);
        async move { relay.peer_count().await == 1 }
    })
    .await);
    assert_eq!(
        a.node.dispatch(b"x".to_vec()).await,
        Err(DispatchError::NoPeers)
    );

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_close_session_reaches_both_sides() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (mut a, mut b) = connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(EchoWorker)).await;

    a.node.close_session(&PeerId::new("peer-b")).unwrap();

    assert_eq!(
        a.wait_disconnected(&PeerId::new("peer-b")).await,
        Some(NodeEvent::PeerDisconnected {
            peer_id: PeerId::new("peer-b"),
            reason: DisconnectReason::LocalClose,
        })
    );
    assert_eq!(
        b.wait_disconnected(&PeerId::new("peer-a")).await,
        Some(NodeEvent::PeerDisconnected {
            peer_id: PeerId::new("peer-a"),
            reason: DisconnectReason::ChannelClosed,
        })
    );
    assert_eq!(a.node.session_state(&PeerId::new("peer-b")), None);

    swarm.shutdown().await;
}

#[tokio::test]
async fn test_stop_closes_every_session() {
    let swarm = SwarmFixture::new().await.unwrap();
    let (mut a, _b) = connected_pair(&swarm, Arc::new(EchoWorker), Arc::new(EchoWorker)).await;

    a.node.stop().await.unwrap();

    assert!(!a.node.is_running());
    assert_eq!(a.node.session_count(), 0);
    assert_eq!(
        a.wait_disconnected(&PeerId::new("peer-b")).await,
        Some(NodeEvent::PeerDisconnected {
            peer_id: PeerId::new("peer-b"),
            reason: DisconnectReason::LocalClose,
        })
    );

    swarm.shutdown().await;
}

// ============================================================================
// TCP transport
// ============================================================================

#[tokio::test]
async fn test_dispatch_over_tcp_links() {
    let swarm = SwarmFixture::new().await.unwrap();
    let link = LinkConfig {
        listen_addr: ([127, 0, 0, 1], 0).into(),
        ..LinkConfig::default()
    };

    let mut a = swarm
        .spawn_node_with(
            "peer-a",
            swarm.node_config(),
            Arc::new(TcpTransport::bind(&link).await.unwrap()),
            Arc::new(EchoWorker),
        )
        .await
        .unwrap();
    let mut b = swarm
        .spawn_node_with(
            "peer-b",
            swarm.node_config(),
            Arc::new(TcpTransport::bind(&link).await.unwrap()),
            Arc::new(DenseLayerWorker),
        )
        .await
        .unwrap();

    a.wait_connected(b.node.peer_id()).await;
    b.wait_connected(a.node.peer_id()).await;

    let request = DenseLayerRequest {
        input: vec![2.0],
        weights: vec![0.5, -0.5],
        bias: vec![0.0, 0.0],
    };
    let report = a
        .node
        .dispatch(serde_json::to_vec(&request).unwrap())
        .await
        .unwrap();
    let TaskResult::Success(bytes) = report.result else {
        panic!("task failed: {:?}", report.result);
    };
    let response: DenseLayerResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(response.output, vec![1.0, 0.0]);

    // And the other direction
    let report = b.node.dispatch(b"echo".to_vec()).await.unwrap();
    assert_eq!(report.result, TaskResult::Success(b"echo".to_vec()));

    swarm.shutdown().await;
}
