use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use device_cluster::message::ClusterEnvelope;
use device_cluster::pool::DispatchPool;
use device_cluster::session::{
    GetPendingMessages, GetSessionSnapshot, SendToCluster, SessionCommand, SessionConnectFailed,
    SessionConnected, SessionDisconnected, SessionHandle, SessionSnapshot,
};
use device_cluster::transport::{InboundHandler, SessionBridge, SessionConnector, SessionRequest};
use device_cluster::{
    ClusterConfig, ClusterResult, PeerAddress, RetryPolicy, SessionManager, StaticMembership,
};

mod common;
use common::{eventually, init_logger, peer, FaultCollector};

#[derive(Default)]
struct RecordingConnector {
    requests: Mutex<Vec<SessionRequest>>,
}

impl RecordingConnector {
    fn requests_to(&self, remote: &PeerAddress) -> Vec<SessionRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.remote == *remote)
            .cloned()
            .collect()
    }

    fn count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl SessionConnector for RecordingConnector {
    fn connect(&self, request: SessionRequest, _bridge: SessionBridge) {
        self.requests.lock().push(request);
    }
}

struct NoInbound;

impl InboundHandler for NoInbound {
    fn on_cluster_message(&self, _from: &PeerAddress, _payload: Bytes) -> ClusterResult<()> {
        Ok(())
    }
}

struct Harness {
    manager: Addr<SessionManager>,
    connector: Arc<RecordingConnector>,
    membership: StaticMembership,
    faults: FaultCollector,
}

impl Harness {
    async fn start(local: &str, members: &[&str], config: ClusterConfig) -> Self {
        Self::start_with_inbound(local, members, config, Arc::new(NoInbound)).await
    }

    async fn start_with_inbound(
        local: &str,
        members: &[&str],
        config: ClusterConfig,
        inbound: Arc<dyn InboundHandler>,
    ) -> Self {
        init_logger();
        let local = peer(local);
        let membership = StaticMembership::new(local.clone(), members.iter().map(|host| peer(host)));
        let connector = Arc::new(RecordingConnector::default());
        let callbacks = Arc::new(DispatchPool::new("callback", 1));
        let faults = FaultCollector::default();
        let supervisor = FaultCollector {
            actor_faults: faults.actor_faults.clone(),
            session_faults: faults.session_faults.clone(),
        }
        .start()
        .recipient();

        let config = config.node_address(local).build().unwrap();
        let manager = {
            let membership = Arc::new(membership.clone());
            let connector = connector.clone();
            SessionManager::create(move |ctx| {
                let bridge = SessionBridge::new(ctx.address(), callbacks, inbound);
                SessionManager::new(&config, membership, connector, bridge).with_supervisor(supervisor)
            })
        };
        let harness = Harness {
            manager,
            connector,
            membership,
            faults,
        };
        // make sure the manager has started and subscribed
        harness.snapshot().await;
        harness
    }

    async fn snapshot(&self) -> SessionSnapshot {
        self.manager.send(GetSessionSnapshot).await.unwrap()
    }

    async fn pending(&self, address: &PeerAddress) -> Vec<ClusterEnvelope> {
        self.manager
            .send(GetPendingMessages(address.clone()))
            .await
            .unwrap()
    }

    async fn send(&self, envelope: ClusterEnvelope) {
        self.manager.send(SendToCluster(envelope)).await.unwrap();
    }

    async fn connect(
        &self,
        address: &PeerAddress,
        session_id: Uuid,
        outbound: bool,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionCommand>) {
        let (handle, rx) = SessionHandle::new(session_id, outbound);
        self.manager
            .send(SessionConnected {
                address: address.clone(),
                handle: handle.clone(),
            })
            .await
            .unwrap();
        (handle, rx)
    }

    /// Complete the latest outbound attempt to `address`
    async fn accept_latest(
        &self,
        address: &PeerAddress,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionCommand>) {
        let request = self
            .connector
            .requests_to(address)
            .pop()
            .expect("no connect attempt to peer");
        self.connect(address, request.session_id, true).await
    }
}

/// Panics on the first payload, records the rest
#[derive(Default)]
struct FlakyInbound {
    panicked: AtomicBool,
    received: Mutex<Vec<(PeerAddress, Bytes)>>,
}

impl InboundHandler for FlakyInbound {
    fn on_cluster_message(&self, from: &PeerAddress, payload: Bytes) -> ClusterResult<()> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("handler blew up on {:?}", payload);
        }
        self.received.lock().push((from.clone(), payload));
        Ok(())
    }
}

fn message(to: Option<&PeerAddress>, n: u8) -> ClusterEnvelope {
    ClusterEnvelope::actor_message(to.cloned(), Bytes::from(vec![n]))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Vec<SessionCommand> {
    let mut out = Vec::new();
    while let Ok(command) = rx.try_recv() {
        out.push(command);
    }
    out
}

fn payloads(commands: &[SessionCommand]) -> Vec<u8> {
    commands
        .iter()
        .filter_map(|command| match command {
            SessionCommand::Send(envelope) => Some(envelope.payload[0]),
            SessionCommand::Close => None,
        })
        .collect()
}

#[actix_rt::test]
async fn test_only_lower_address_initiates() {
    let lower = Harness::start("10.0.0.1", &["10.0.0.2"], ClusterConfig::new()).await;
    let higher = Harness::start("10.0.0.2", &["10.0.0.1"], ClusterConfig::new()).await;

    assert_eq!(lower.connector.requests_to(&peer("10.0.0.2")).len(), 1);
    assert_eq!(higher.connector.count(), 0);
    assert_eq!(lower.snapshot().await.connecting.len(), 1);
    assert!(higher.snapshot().await.connecting.is_empty());
}

#[actix_rt::test]
async fn test_member_added_connects_only_to_higher_peer() {
    let harness = Harness::start("10.0.0.5", &[], ClusterConfig::new()).await;

    harness.membership.add_member(peer("10.0.0.9"));
    harness.membership.add_member(peer("10.0.0.3"));
    harness.snapshot().await;

    assert_eq!(harness.connector.requests_to(&peer("10.0.0.9")).len(), 1);
    assert!(harness.connector.requests_to(&peer("10.0.0.3")).is_empty());
}

#[actix_rt::test]
async fn test_broadcast_then_join() {
    let p1 = peer("10.0.0.2");
    let p2 = peer("10.0.0.3");
    let harness = Harness::start("10.0.0.1", &["10.0.0.2", "10.0.0.3"], ClusterConfig::new()).await;
    assert!(harness.snapshot().await.sessions.is_empty());

    harness.send(message(None, 42)).await;
    assert_eq!(harness.pending(&p1).await, vec![message(Some(&p1), 42)]);
    assert_eq!(harness.pending(&p2).await, vec![message(Some(&p2), 42)]);

    let (_handle, mut rx) = harness.accept_latest(&p1).await;
    assert_eq!(drain(&mut rx), vec![SessionCommand::Send(message(Some(&p1), 42))]);

    let snapshot = harness.snapshot().await;
    assert!(!snapshot.pending.contains_key(&p1));
    assert_eq!(snapshot.pending.get(&p2), Some(&1));
    assert_eq!(harness.pending(&p2).await, vec![message(Some(&p2), 42)]);
}

#[actix_rt::test]
async fn test_queued_messages_delivered_in_order_exactly_once() {
    let p1 = peer("10.0.0.2");
    let harness = Harness::start("10.0.0.1", &["10.0.0.2"], ClusterConfig::new()).await;

    for n in 0..5 {
        harness.send(message(Some(&p1), n)).await;
    }
    let (_handle, mut rx) = harness.accept_latest(&p1).await;
    harness.send(message(Some(&p1), 5)).await;

    assert_eq!(payloads(&drain(&mut rx)), vec![0, 1, 2, 3, 4, 5]);
    assert!(harness.pending(&p1).await.is_empty());
}

#[actix_rt::test]
async fn test_lost_writer_requeues_and_reconnects() {
    let p1 = peer("10.0.0.2");
    let harness = Harness::start("10.0.0.1", &["10.0.0.2"], ClusterConfig::new()).await;
    let (handle, rx) = harness.accept_latest(&p1).await;
    drop(rx);

    harness.send(message(Some(&p1), 1)).await;
    harness.send(message(Some(&p1), 2)).await;

    let snapshot = harness.snapshot().await;
    assert!(snapshot.sessions.is_empty());
    assert_eq!(payloads_of(&harness.pending(&p1).await), vec![1, 2]);

    let attempts = harness.connector.requests_to(&p1);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].session_id, handle.session_id());

    let (_handle, mut rx) = harness.accept_latest(&p1).await;
    assert_eq!(payloads(&drain(&mut rx)), vec![1, 2]);
}

fn payloads_of(envelopes: &[ClusterEnvelope]) -> Vec<u8> {
    envelopes.iter().map(|envelope| envelope.payload[0]).collect()
}

#[actix_rt::test]
async fn test_duplicate_session_replaces_previous() {
    let lower = peer("10.0.0.1");
    let harness = Harness::start("10.0.0.2", &["10.0.0.1"], ClusterConfig::new()).await;

    let (first, mut first_rx) = harness.connect(&lower, Uuid::new_v4(), false).await;
    let (second, _second_rx) = harness.connect(&lower, Uuid::new_v4(), false).await;

    assert_eq!(drain(&mut first_rx), vec![SessionCommand::Close]);
    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.sessions.get(&lower), Some(&second.session_id()));

    // the replaced connection reporting its end must not remove the new one
    harness
        .manager
        .send(SessionDisconnected {
            address: lower.clone(),
            session_id: first.session_id(),
            connection_id: first.connection_id(),
        })
        .await
        .unwrap();
    assert_eq!(
        harness.snapshot().await.sessions.get(&lower),
        Some(&second.session_id())
    );
}

#[actix_rt::test]
async fn test_stale_event_after_reconnect_is_ignored() {
    let p1 = peer("10.0.0.2");
    let harness = Harness::start("10.0.0.1", &["10.0.0.2"], ClusterConfig::new()).await;
    let (first, _first_rx) = harness.accept_latest(&p1).await;

    harness
        .manager
        .send(SessionDisconnected {
            address: p1.clone(),
            session_id: first.session_id(),
            connection_id: first.connection_id(),
        })
        .await
        .unwrap();
    let (second, _second_rx) = harness.accept_latest(&p1).await;
    assert_eq!(second.session_id(), first.session_id());

    // a late duplicate report about the first connection
    harness
        .manager
        .send(SessionDisconnected {
            address: p1.clone(),
            session_id: first.session_id(),
            connection_id: first.connection_id(),
        })
        .await
        .unwrap();

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.sessions.get(&p1), Some(&second.session_id()));
    assert_eq!(harness.connector.requests_to(&p1).len(), 2);
}

#[actix_rt::test]
async fn test_only_initiator_reconnects() {
    let lower = Harness::start("10.0.0.1", &["10.0.0.2"], ClusterConfig::new()).await;
    let higher = Harness::start("10.0.0.2", &["10.0.0.1"], ClusterConfig::new()).await;

    let (out_handle, _out_rx) = lower.accept_latest(&peer("10.0.0.2")).await;
    let (in_handle, _in_rx) = higher
        .connect(&peer("10.0.0.1"), out_handle.session_id(), false)
        .await;

    lower
        .manager
        .send(SessionDisconnected {
            address: peer("10.0.0.2"),
            session_id: out_handle.session_id(),
            connection_id: out_handle.connection_id(),
        })
        .await
        .unwrap();
    higher
        .manager
        .send(SessionDisconnected {
            address: peer("10.0.0.1"),
            session_id: in_handle.session_id(),
            connection_id: in_handle.connection_id(),
        })
        .await
        .unwrap();

    let attempts = lower.connector.requests_to(&peer("10.0.0.2"));
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].session_id, out_handle.session_id());
    assert_eq!(higher.connector.count(), 0);
}

#[actix_rt::test]
async fn test_unexpected_outbound_session_is_closed() {
    let p1 = peer("10.0.0.2");
    let harness = Harness::start("10.0.0.1", &["10.0.0.2"], ClusterConfig::new()).await;

    let (_handle, mut rx) = harness.connect(&p1, Uuid::new_v4(), true).await;

    assert_eq!(drain(&mut rx), vec![SessionCommand::Close]);
    assert!(harness.snapshot().await.sessions.is_empty());
}

#[actix_rt::test]
async fn test_removed_peer_is_not_reconnected() {
    let p1 = peer("10.0.0.2");
    let harness = Harness::start("10.0.0.1", &["10.0.0.2"], ClusterConfig::new()).await;
    let (_handle, mut rx) = harness.accept_latest(&p1).await;

    harness.membership.remove_member(&p1);
    harness.send(message(Some(&p1), 9)).await;
    let snapshot = harness.snapshot().await;

    assert_eq!(drain(&mut rx), vec![SessionCommand::Close]);
    assert!(snapshot.sessions.is_empty());
    assert_eq!(harness.connector.requests_to(&p1).len(), 1);

    // whatever was queued meanwhile is discarded when the peer is removed again
    harness.membership.add_member(p1.clone());
    harness.membership.remove_member(&p1);
    assert!(harness.pending(&p1).await.is_empty());
}

#[actix_rt::test]
async fn test_retry_budget_exhaustion_reports_fault() {
    let p1 = peer("10.0.0.2");
    let config = ClusterConfig::new()
        .session_retry(RetryPolicy {
            max_failures: 2,
            window: Duration::from_secs(60),
        })
        .reconnect_delay(Duration::from_millis(10));
    let harness = Harness::start("10.0.0.1", &["10.0.0.2"], config).await;

    let mut seen = 0;
    for _ in 0..3 {
        let ok = eventually(Duration::from_secs(2), || harness.connector.requests_to(&p1).len() > seen).await;
        assert!(ok, "no connect attempt after {} failures", seen);
        let request = harness.connector.requests_to(&p1).pop().unwrap();
        seen += 1;
        harness
            .manager
            .send(SessionConnectFailed {
                address: p1.clone(),
                session_id: request.session_id,
                error: "connection refused".to_string(),
            })
            .await
            .unwrap();
    }

    let faults = harness.faults.session_faults.clone();
    assert!(eventually(Duration::from_secs(2), || faults.lock().len() == 1).await);
    let fault = faults.lock()[0].clone();
    assert_eq!(fault.address, p1);
    assert_eq!(fault.failures, 3);
    assert_eq!(fault.error, "connection refused");

    actix_rt::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.connector.requests_to(&p1).len(), 3);
    assert_eq!(harness.snapshot().await.abandoned, vec![p1.clone()]);

    // a rejoin clears the abandonment
    harness.membership.remove_member(&p1);
    harness.membership.add_member(p1.clone());
    assert!(harness.snapshot().await.abandoned.is_empty());
    assert_eq!(harness.connector.requests_to(&p1).len(), 4);
}

#[actix_rt::test]
async fn test_pending_queue_drops_oldest_when_full() {
    let p1 = peer("10.0.0.2");
    let config = ClusterConfig::new().max_pending_per_peer(3);
    let harness = Harness::start("10.0.0.1", &["10.0.0.2"], config).await;

    for n in 0..5 {
        harness.send(message(Some(&p1), n)).await;
    }

    assert_eq!(payloads_of(&harness.pending(&p1).await), vec![2, 3, 4]);
    assert_eq!(harness.snapshot().await.dropped, 2);
}

#[actix_rt::test]
async fn test_message_to_self_is_dropped() {
    let harness = Harness::start("10.0.0.1", &[], ClusterConfig::new()).await;

    harness.send(message(Some(&peer("10.0.0.1")), 1)).await;

    let snapshot = harness.snapshot().await;
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.dropped, 0);
}

#[actix_rt::test]
async fn test_bad_frames_and_panicking_handler_keep_session_up() {
    let inbound = Arc::new(FlakyInbound::default());
    let harness = Harness::start_with_inbound(
        "10.0.0.2",
        &["10.0.0.1"],
        ClusterConfig::new(),
        inbound.clone(),
    )
    .await;
    let p1 = peer("10.0.0.1");
    let session_id = Uuid::new_v4();
    let (_handle, _rx) = harness.connect(&p1, session_id, false).await;

    let bridge = SessionBridge::new(
        harness.manager.clone(),
        Arc::new(DispatchPool::new("callback", 1)),
        inbound.clone(),
    );
    let local = peer("10.0.0.2");
    let frame = |n| message(Some(&local), n).encode().unwrap();
    bridge.on_frame(p1.clone(), session_id, Bytes::from_static(b"\xff\x00garbage"));
    bridge.on_frame(p1.clone(), session_id, frame(1));
    bridge.on_frame(p1.clone(), session_id, frame(2));

    assert!(eventually(Duration::from_secs(2), || inbound.received.lock().len() == 1).await);
    assert!(inbound.panicked.load(Ordering::SeqCst));
    let received = inbound.received.lock().clone();
    assert_eq!(received, vec![(p1.clone(), Bytes::from(vec![2u8]))]);
    assert_eq!(harness.snapshot().await.sessions.get(&p1), Some(&session_id));
}
