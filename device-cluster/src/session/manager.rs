//! The cluster RPC session manager.
//!
//! One instance per node. It is the only owner of the session registry and
//! of the per-peer pending queues; everything else talks to it by message.
//! Between two nodes only the one whose address sorts lower opens the
//! session, and only that side reconnects after the session drops.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{ClusterConfig, RetryPolicy};
use crate::membership::{MembershipEvent, MembershipProvider};
use crate::message::ClusterEnvelope;
use crate::node::PeerAddress;
use crate::session::{
    CreateSession, GetPendingMessages, GetSessionSnapshot, SendToCluster, SessionClosed,
    SessionConnectFailed, SessionConnected, SessionDisconnected, SessionHandle, SessionSnapshot,
    StopSessions,
};
use crate::supervision::{BudgetVerdict, FailureBudget, SessionFault};
use crate::transport::{SessionBridge, SessionConnector, SessionRequest};

/// Mailbox-serialized owner of this node's peer sessions
pub struct SessionManager {
    local: PeerAddress,
    membership: Arc<dyn MembershipProvider>,
    connector: Arc<dyn SessionConnector>,
    bridge: SessionBridge,
    sessions: HashMap<PeerAddress, SessionHandle>,
    connecting: HashMap<PeerAddress, Uuid>,
    pending: HashMap<PeerAddress, VecDeque<ClusterEnvelope>>,
    budgets: HashMap<PeerAddress, FailureBudget>,
    abandoned: BTreeSet<PeerAddress>,
    max_pending: usize,
    retry: RetryPolicy,
    reconnect_delay: Duration,
    supervisor: Option<Recipient<SessionFault>>,
    outbox: Option<mpsc::UnboundedReceiver<ClusterEnvelope>>,
    dropped: u64,
}

impl SessionManager {
    /// Create a manager for the node described by `config`
    pub fn new(
        config: &ClusterConfig,
        membership: Arc<dyn MembershipProvider>,
        connector: Arc<dyn SessionConnector>,
        bridge: SessionBridge,
    ) -> Self {
        SessionManager {
            local: config.node_address.clone(),
            membership,
            connector,
            bridge,
            sessions: HashMap::new(),
            connecting: HashMap::new(),
            pending: HashMap::new(),
            budgets: HashMap::new(),
            abandoned: BTreeSet::new(),
            max_pending: config.max_pending_per_peer,
            retry: config.session_retry,
            reconnect_delay: config.reconnect_delay,
            supervisor: None,
            outbox: None,
            dropped: 0,
        }
    }

    /// Report abandoned peers to `supervisor`
    pub fn with_supervisor(mut self, supervisor: Recipient<SessionFault>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Also accept envelopes from an outbox channel, in channel order
    pub fn with_outbox(mut self, outbox: mpsc::UnboundedReceiver<ClusterEnvelope>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Tie-break: the lower-sorted address of a pair opens the session
    fn initiates_to(&self, peer: &PeerAddress) -> bool {
        self.local < *peer
    }

    fn create_session(&mut self, address: PeerAddress, session_id: Uuid) {
        if self.sessions.contains_key(&address) {
            debug!("[{}] Session already registered, not connecting", address);
            return;
        }
        if let Some(existing) = self.connecting.get(&address) {
            debug!("[{}][{}] Connect already in progress", address, existing);
            return;
        }
        if self.abandoned.contains(&address) {
            debug!("[{}] Retry budget exhausted, not connecting", address);
            return;
        }

        info!("[{}][{}] Creating session", address, session_id);
        self.connecting.insert(address.clone(), session_id);
        self.connector.connect(
            SessionRequest {
                session_id,
                local: self.local.clone(),
                remote: address,
            },
            self.bridge.clone(),
        );
    }

    fn register(&mut self, address: PeerAddress, handle: SessionHandle, ctx: &mut Context<Self>) {
        info!(
            "[{}][{}] Session registered ({})",
            address,
            handle.session_id(),
            if handle.is_outbound() { "outbound" } else { "inbound" }
        );
        self.sessions.insert(address.clone(), handle);
        self.abandoned.remove(&address);

        // registration and drain happen in the same mailbox turn
        if let Some(queue) = self.pending.remove(&address) {
            info!("[{}] Delivering {} pending message(s)", address, queue.len());
            self.flush(&address, queue, ctx);
        }
    }

    /// Hand `queue` to the registered session in order; whatever cannot be
    /// handed over goes back to the front of the pending queue
    fn flush(&mut self, address: &PeerAddress, mut queue: VecDeque<ClusterEnvelope>, ctx: &mut Context<Self>) {
        while let Some(envelope) = queue.pop_front() {
            let handle = match self.sessions.get(address) {
                Some(handle) => handle.clone(),
                None => {
                    queue.push_front(envelope);
                    break;
                }
            };
            if let Err(envelope) = handle.tell(envelope) {
                queue.push_front(envelope);
                self.session_lost(address, &handle, "session writer closed", ctx);
                break;
            }
        }

        if !queue.is_empty() {
            if let Some(newer) = self.pending.remove(address) {
                queue.extend(newer);
            }
            while queue.len() > self.max_pending {
                queue.pop_front();
                self.dropped += 1;
            }
            self.pending.insert(address.clone(), queue);
        }
    }

    fn enqueue(&mut self, address: PeerAddress, envelope: ClusterEnvelope) {
        let queue = self.pending.entry(address.clone()).or_insert_with(|| {
            debug!("[{}] Created pending queue", address);
            VecDeque::new()
        });
        if queue.len() >= self.max_pending {
            queue.pop_front();
            self.dropped += 1;
            warn!(
                "[{}] Pending queue full ({}), dropped oldest message",
                address, self.max_pending
            );
        }
        queue.push_back(envelope);
    }

    fn send(&mut self, envelope: ClusterEnvelope, ctx: &mut Context<Self>) {
        match envelope.destination.clone() {
            Some(address) => self.unicast(address, envelope, ctx),
            None => self.broadcast(envelope, ctx),
        }
    }

    fn unicast(&mut self, address: PeerAddress, envelope: ClusterEnvelope, ctx: &mut Context<Self>) {
        if address == self.local {
            warn!("[{}] Dropping envelope addressed to this node", address);
            return;
        }
        let handle = match self.sessions.get(&address) {
            Some(handle) => handle.clone(),
            None => {
                trace!("[{}] No session, queueing message", address);
                self.enqueue(address, envelope);
                return;
            }
        };
        if let Err(envelope) = handle.tell(envelope) {
            self.session_lost(&address, &handle, "session writer closed", ctx);
            self.enqueue(address, envelope);
        }
    }

    fn broadcast(&mut self, envelope: ClusterEnvelope, ctx: &mut Context<Self>) {
        let mut failed = Vec::new();
        for (address, handle) in &self.sessions {
            if let Err(copy) = handle.tell(envelope.addressed_to(address.clone())) {
                failed.push((address.clone(), handle.clone(), copy));
            }
        }

        // existing queues plus members still waiting for a session
        let mut queued: BTreeSet<PeerAddress> = self.pending.keys().cloned().collect();
        queued.extend(
            self.membership
                .other_members()
                .into_iter()
                .filter(|peer| !self.sessions.contains_key(peer)),
        );
        for address in queued {
            let copy = envelope.addressed_to(address.clone());
            self.enqueue(address, copy);
        }

        for (address, handle, copy) in failed {
            self.session_lost(&address, &handle, "session writer closed", ctx);
            self.enqueue(address, copy);
        }
    }

    /// Remove the session if `handle` is still the registered one, then
    /// reconnect if this side opened it and the peer is still a member
    fn session_lost(
        &mut self,
        address: &PeerAddress,
        lost: &SessionHandle,
        reason: &str,
        ctx: &mut Context<Self>,
    ) {
        let current = match self.sessions.get(address) {
            Some(handle) if handle.connection_id() == lost.connection_id() => handle.clone(),
            _ => {
                debug!(
                    "[{}][{}] Ignoring stale event for connection {}",
                    address,
                    lost.session_id(),
                    lost.connection_id()
                );
                return;
            }
        };
        self.sessions.remove(address);
        current.close();
        info!(
            "[{}][{}] Session removed: {}",
            address,
            current.session_id(),
            reason
        );

        if !self.membership.is_member(address) {
            debug!("[{}] Peer is no longer a member, not reconnecting", address);
        } else if current.is_outbound() {
            self.retry(address.clone(), current.session_id(), reason, None, ctx);
        } else {
            debug!("[{}] Waiting for peer to reconnect", address);
        }
    }

    /// Session lost, identified by ids carried in a transport event
    fn lost_by_id(
        &mut self,
        address: &PeerAddress,
        session_id: Uuid,
        connection_id: u64,
        reason: &str,
        ctx: &mut Context<Self>,
    ) {
        let handle = match self.sessions.get(address) {
            Some(handle)
                if handle.session_id() == session_id && handle.connection_id() == connection_id =>
            {
                handle.clone()
            }
            _ => {
                debug!(
                    "[{}][{}] Ignoring stale event for connection {}",
                    address, session_id, connection_id
                );
                return;
            }
        };
        self.session_lost(address, &handle, reason, ctx);
    }

    fn retry(
        &mut self,
        address: PeerAddress,
        session_id: Uuid,
        reason: &str,
        delay: Option<Duration>,
        ctx: &mut Context<Self>,
    ) {
        let policy = self.retry;
        let budget = self
            .budgets
            .entry(address.clone())
            .or_insert_with(|| FailureBudget::new(policy));
        match budget.record_failure() {
            BudgetVerdict::Retry(failures) => {
                info!(
                    "[{}][{}] Reconnecting ({} failure(s) in window)",
                    address, session_id, failures
                );
                match delay {
                    None => self.create_session(address, session_id),
                    Some(delay) => {
                        ctx.notify_later(
                            CreateSession {
                                address,
                                session_id,
                            },
                            delay,
                        );
                    }
                }
            }
            BudgetVerdict::Exhausted(failures) => {
                error!(
                    "[{}][{}] {} failures within {:?}, giving up until the peer rejoins",
                    address, session_id, failures, policy.window
                );
                self.abandoned.insert(address.clone());
                if let Some(supervisor) = &self.supervisor {
                    supervisor.do_send(SessionFault {
                        address,
                        session_id,
                        failures,
                        window: policy.window,
                        error: reason.to_string(),
                    });
                }
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sessions: self
                .sessions
                .iter()
                .map(|(addr, handle)| (addr.clone(), handle.session_id()))
                .collect(),
            connecting: self
                .connecting
                .iter()
                .map(|(addr, id)| (addr.clone(), *id))
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|(addr, queue)| (addr.clone(), queue.len()))
                .collect(),
            abandoned: self.abandoned.iter().cloned().collect(),
            dropped: self.dropped,
        }
    }
}

impl Actor for SessionManager {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("[{}] Session manager started", self.local);
        // subscribe before enumerating so no join is missed
        self.membership.subscribe(ctx.address().recipient());

        if let Some(outbox) = self.outbox.take() {
            ctx.add_stream(futures::stream::unfold(outbox, |mut rx| async move {
                rx.recv().await.map(|envelope| (envelope, rx))
            }));
        }

        for peer in self.membership.other_members() {
            if self.initiates_to(&peer) {
                self.create_session(peer, Uuid::new_v4());
            } else {
                debug!("[{}] Waiting for inbound session", peer);
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        for (address, handle) in self.sessions.drain() {
            debug!("[{}][{}] Closing session on shutdown", address, handle.session_id());
            handle.close();
        }
        info!("[{}] Session manager stopped", self.local);
    }
}

impl Handler<MembershipEvent> for SessionManager {
    type Result = ();

    fn handle(&mut self, msg: MembershipEvent, _ctx: &mut Self::Context) {
        match msg {
            MembershipEvent::Added(peer) => {
                if peer == self.local {
                    return;
                }
                self.abandoned.remove(&peer);
                self.budgets.remove(&peer);
                if self.initiates_to(&peer) {
                    self.create_session(peer, Uuid::new_v4());
                } else {
                    debug!("[{}] Peer joined, waiting for inbound session", peer);
                }
            }
            MembershipEvent::Removed(peer) => {
                self.connecting.remove(&peer);
                self.budgets.remove(&peer);
                self.abandoned.remove(&peer);
                if let Some(handle) = self.sessions.remove(&peer) {
                    info!("[{}][{}] Peer left, closing session", peer, handle.session_id());
                    handle.close();
                }
                if let Some(queue) = self.pending.remove(&peer) {
                    warn!("[{}] Peer left, discarding {} pending message(s)", peer, queue.len());
                }
            }
        }
    }
}

impl Handler<CreateSession> for SessionManager {
    type Result = ();

    fn handle(&mut self, msg: CreateSession, _ctx: &mut Self::Context) {
        if !self.membership.is_member(&msg.address) {
            debug!("[{}] Not a member any more, skipping connect", msg.address);
            return;
        }
        self.create_session(msg.address, msg.session_id);
    }
}

impl Handler<SessionConnected> for SessionManager {
    type Result = ();

    fn handle(&mut self, msg: SessionConnected, ctx: &mut Self::Context) {
        let SessionConnected { address, handle } = msg;
        if address == self.local {
            warn!("[{}] Refusing session to this node", address);
            handle.close();
            return;
        }

        if handle.is_outbound() {
            match self.connecting.get(&address) {
                Some(id) if *id == handle.session_id() => {
                    self.connecting.remove(&address);
                }
                _ => {
                    debug!(
                        "[{}][{}] Closing outbound session nobody is waiting for",
                        address,
                        handle.session_id()
                    );
                    handle.close();
                    return;
                }
            }
        }

        if let Some(previous) = self.sessions.remove(&address) {
            warn!(
                "[{}] Replacing session {} with {}",
                address,
                previous.session_id(),
                handle.session_id()
            );
            previous.close();
        }
        self.register(address, handle, ctx);
    }
}

impl Handler<SessionDisconnected> for SessionManager {
    type Result = ();

    fn handle(&mut self, msg: SessionDisconnected, ctx: &mut Self::Context) {
        self.lost_by_id(&msg.address, msg.session_id, msg.connection_id, "disconnected", ctx);
    }
}

impl Handler<SessionClosed> for SessionManager {
    type Result = ();

    fn handle(&mut self, msg: SessionClosed, ctx: &mut Self::Context) {
        self.lost_by_id(&msg.address, msg.session_id, msg.connection_id, &msg.error, ctx);
    }
}

impl Handler<SessionConnectFailed> for SessionManager {
    type Result = ();

    fn handle(&mut self, msg: SessionConnectFailed, ctx: &mut Self::Context) {
        match self.connecting.get(&msg.address) {
            Some(id) if *id == msg.session_id => {
                self.connecting.remove(&msg.address);
            }
            _ => {
                debug!("[{}][{}] Ignoring stale connect failure", msg.address, msg.session_id);
                return;
            }
        }
        if self.membership.is_member(&msg.address) {
            let delay = self.reconnect_delay;
            self.retry(msg.address, msg.session_id, &msg.error, Some(delay), ctx);
        }
    }
}

impl Handler<SendToCluster> for SessionManager {
    type Result = ();

    fn handle(&mut self, msg: SendToCluster, ctx: &mut Self::Context) {
        self.send(msg.0, ctx);
    }
}

impl StreamHandler<ClusterEnvelope> for SessionManager {
    fn handle(&mut self, envelope: ClusterEnvelope, ctx: &mut Self::Context) {
        self.send(envelope, ctx);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("[{}] Outbox closed", self.local);
    }
}

impl Handler<GetSessionSnapshot> for SessionManager {
    type Result = SessionSnapshot;

    fn handle(&mut self, _msg: GetSessionSnapshot, _ctx: &mut Self::Context) -> Self::Result {
        self.snapshot()
    }
}

impl Handler<GetPendingMessages> for SessionManager {
    type Result = MessageResult<GetPendingMessages>;

    fn handle(&mut self, msg: GetPendingMessages, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(
            self.pending
                .get(&msg.0)
                .map(|queue| queue.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }
}

impl Handler<StopSessions> for SessionManager {
    type Result = ();

    fn handle(&mut self, _msg: StopSessions, ctx: &mut Self::Context) {
        ctx.stop();
    }
}
