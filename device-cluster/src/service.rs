//! Node assembly.
//!
//! [`ClusterNode`] wires the pieces of one cluster node together: dispatch
//! pools, the entity registry, the session manager with its transport, the
//! entity router and the inbound message dispatcher.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use actix::prelude::*;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::ClusterConfig;
use crate::entity::{
    self, ClusterSender, DeviceDao, DeviceEventSink, EntityRegistry, EntityServices,
    EntitySettings, FromDeviceRpcResponse, RpcResponseSink, ToEntityMsg, TransportService,
};
use crate::error::{ClusterError, ClusterResult};
use crate::membership::{MembershipProvider, StaticMembership};
use crate::message::{ClusterEnvelope, MessageRegistry, WireMessage};
use crate::node::PeerAddress;
use crate::pool::DispatchPool;
use crate::routing::{EntityRouter, RoutingWatcher, StopRouting};
use crate::session::{GetSessionSnapshot, SessionManager, SessionSnapshot, StopSessions};
use crate::supervision::{ActorFault, SessionFault};
use crate::transport::{
    InboundHandler, MemoryNetwork, SessionBridge, SessionConnector, TcpConnector,
    TcpSessionListener,
};

/// [`ClusterSender`] feeding the session manager's outbox
#[derive(Clone)]
pub struct ClusterClient {
    local: PeerAddress,
    outbox: mpsc::UnboundedSender<ClusterEnvelope>,
}

impl ClusterClient {
    /// Client for `local` writing into `outbox`
    pub fn new(local: PeerAddress, outbox: mpsc::UnboundedSender<ClusterEnvelope>) -> Self {
        ClusterClient { local, outbox }
    }
}

impl ClusterSender for ClusterClient {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    fn send_to_cluster(&self, target: Option<PeerAddress>, payload: Bytes) -> ClusterResult<()> {
        self.outbox
            .send(ClusterEnvelope::actor_message(target, payload))
            .map_err(|_| ClusterError::ChannelClosed)
    }
}

/// Routes decoded inbound payloads to their consumers
pub struct NodeDispatcher {
    messages: MessageRegistry,
    registry: EntityRegistry,
    rpc_responses: Arc<dyn RpcResponseSink>,
    application: Option<Arc<dyn InboundHandler>>,
}

impl InboundHandler for NodeDispatcher {
    fn on_cluster_message(&self, from: &PeerAddress, payload: Bytes) -> ClusterResult<()> {
        let decoded = self.messages.decode(&payload)?;
        if decoded.is::<ToEntityMsg>() {
            let msg = decoded.downcast::<ToEntityMsg>()?;
            debug!("[{}] Remote message for entity {}", from, msg.entity_id);
            self.registry.tell(msg);
        } else if decoded.is::<FromDeviceRpcResponse>() {
            self.rpc_responses
                .on_rpc_response(decoded.downcast::<FromDeviceRpcResponse>()?);
        } else if let Some(application) = &self.application {
            application.on_cluster_message(from, payload)?;
        } else {
            warn!("[{}] No handler for message kind {}", from, decoded.kind());
        }
        Ok(())
    }
}

/// How a node reaches its peers
#[derive(Clone)]
pub enum TransportKind {
    /// Length-prefixed frames over TCP
    Tcp,
    /// In-process links on a shared network
    Memory(MemoryNetwork),
}

impl fmt::Debug for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("Tcp"),
            TransportKind::Memory(_) => f.write_str("Memory"),
        }
    }
}

/// Builder for a [`ClusterNode`]
pub struct ClusterNodeBuilder {
    config: ClusterConfig,
    membership: Option<Arc<dyn MembershipProvider>>,
    dao: Option<Arc<dyn DeviceDao>>,
    transport: Option<Arc<dyn TransportService>>,
    events: Option<Arc<dyn DeviceEventSink>>,
    rpc_responses: Option<Arc<dyn RpcResponseSink>>,
    application: Option<Arc<dyn InboundHandler>>,
    messages: MessageRegistry,
    transport_kind: TransportKind,
    session_supervisor: Option<Recipient<SessionFault>>,
    actor_supervisor: Option<Recipient<ActorFault>>,
}

impl ClusterNodeBuilder {
    /// Membership provider; defaults to a [`StaticMembership`] with no peers
    pub fn membership(mut self, membership: Arc<dyn MembershipProvider>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Persistence used by device actors
    pub fn device_dao(mut self, dao: Arc<dyn DeviceDao>) -> Self {
        self.dao = Some(dao);
        self
    }

    /// Device-facing transport sessions
    pub fn transport_service(mut self, transport: Arc<dyn TransportService>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Consumer of telemetry, attribute and device RPC events
    pub fn device_events(mut self, events: Arc<dyn DeviceEventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Consumer of server-side RPC outcomes
    pub fn rpc_responses(mut self, sink: Arc<dyn RpcResponseSink>) -> Self {
        self.rpc_responses = Some(sink);
        self
    }

    /// Handler for registered application messages the node does not
    /// consume itself
    pub fn application_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.application = Some(handler);
        self
    }

    /// Accept `T` from peers
    pub fn register_message<T: WireMessage>(mut self) -> Self {
        self.messages.register::<T>();
        self
    }

    /// Use in-process links on `network` instead of TCP
    pub fn memory_transport(mut self, network: MemoryNetwork) -> Self {
        self.transport_kind = TransportKind::Memory(network);
        self
    }

    /// Notify `supervisor` when a peer's retry budget runs out
    pub fn session_supervisor(mut self, supervisor: Recipient<SessionFault>) -> Self {
        self.session_supervisor = Some(supervisor);
        self
    }

    /// Notify `supervisor` when an entity actor is stopped after failures
    pub fn actor_supervisor(mut self, supervisor: Recipient<ActorFault>) -> Self {
        self.actor_supervisor = Some(supervisor);
        self
    }

    /// Start the node; must run inside an actix system
    pub fn start(self) -> ClusterResult<ClusterNode> {
        let config = self.config.build()?;
        let local = config.node_address.clone();
        let dao = self.dao.ok_or_else(|| missing("device DAO"))?;
        let transport = self.transport.ok_or_else(|| missing("transport service"))?;
        let events = self.events.ok_or_else(|| missing("device event sink"))?;
        let rpc_responses = self.rpc_responses.ok_or_else(|| missing("RPC response sink"))?;
        let membership: Arc<dyn MembershipProvider> = match self.membership {
            Some(membership) => membership,
            None => Arc::new(StaticMembership::new(local.clone(), Vec::new())),
        };
        if membership.current_node() != local {
            return Err(ClusterError::ConfigurationError(format!(
                "membership is for {} but node address is {}",
                membership.current_node(),
                local
            )));
        }

        let entity_pool = Arc::new(DispatchPool::new("entity", config.entity_pool_size));
        let control_pool = Arc::new(DispatchPool::new("control", 1));
        let callback_pool = Arc::new(DispatchPool::new("callback", config.callback_pool_size));
        let io_pool = Arc::new(DispatchPool::new("io", 1));

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let client = ClusterClient::new(local.clone(), outbox_tx);

        let services = EntityServices {
            dao,
            transport,
            events,
            rpc_responses: rpc_responses.clone(),
            cluster: Arc::new(client.clone()),
            settings: EntitySettings::from(&config),
        };
        let registry = EntityRegistry::new(services, entity_pool.clone());
        if let Some(supervisor) = self.actor_supervisor {
            registry.set_fault_listener(supervisor);
        }

        let mut messages = self.messages;
        entity::register_kinds(&mut messages);
        let dispatcher: Arc<dyn InboundHandler> = Arc::new(NodeDispatcher {
            messages: messages.clone(),
            registry: registry.clone(),
            rpc_responses,
            application: self.application,
        });

        let connector: Arc<dyn SessionConnector> = match &self.transport_kind {
            TransportKind::Tcp => Arc::new(TcpConnector::new(io_pool.clone())),
            TransportKind::Memory(network) => Arc::new(network.connector(local.clone())),
        };

        let manager = {
            let config = config.clone();
            let membership = membership.clone();
            let callbacks = callback_pool.clone();
            let dispatcher = dispatcher.clone();
            let supervisor = self.session_supervisor;
            SessionManager::start_in_arbiter(&control_pool.next_handle(), move |ctx| {
                let bridge = SessionBridge::new(ctx.address(), callbacks, dispatcher);
                let manager = SessionManager::new(&config, membership, connector, bridge)
                    .with_outbox(outbox_rx);
                match supervisor {
                    Some(supervisor) => manager.with_supervisor(supervisor),
                    None => manager,
                }
            })
        };

        let bridge = SessionBridge::new(manager.clone(), callback_pool.clone(), dispatcher.clone());
        let listener = match &self.transport_kind {
            TransportKind::Tcp => match TcpSessionListener::bind(&local, bridge, &io_pool) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    manager.do_send(StopSessions);
                    for pool in [&entity_pool, &control_pool, &callback_pool, &io_pool] {
                        pool.stop();
                    }
                    return Err(e);
                }
            },
            TransportKind::Memory(network) => {
                network.register(local.clone(), bridge);
                None
            }
        };

        let router = EntityRouter::new(local.clone(), &membership.other_members(), config.virtual_nodes);
        let watcher = {
            let watcher = RoutingWatcher::new(router.clone(), registry.clone(), membership.clone());
            RoutingWatcher::start_in_arbiter(&control_pool.next_handle(), move |_| watcher)
        };

        info!("[{}] Cluster node started ({:?} transport)", local, self.transport_kind);
        Ok(ClusterNode {
            local,
            config,
            membership,
            router,
            registry,
            manager,
            watcher,
            client,
            dispatcher,
            messages,
            transport_kind: self.transport_kind,
            listener,
            pools: vec![entity_pool, control_pool, callback_pool, io_pool],
        })
    }
}

fn missing(what: &str) -> ClusterError {
    ClusterError::ConfigurationError(format!("no {} configured", what))
}

/// One running cluster node
pub struct ClusterNode {
    local: PeerAddress,
    config: ClusterConfig,
    membership: Arc<dyn MembershipProvider>,
    router: EntityRouter,
    registry: EntityRegistry,
    manager: Addr<SessionManager>,
    watcher: Addr<RoutingWatcher>,
    client: ClusterClient,
    dispatcher: Arc<dyn InboundHandler>,
    messages: MessageRegistry,
    transport_kind: TransportKind,
    listener: Option<TcpSessionListener>,
    pools: Vec<Arc<DispatchPool>>,
}

impl ClusterNode {
    /// Start building a node from `config`
    pub fn builder(config: ClusterConfig) -> ClusterNodeBuilder {
        ClusterNodeBuilder {
            config,
            membership: None,
            dao: None,
            transport: None,
            events: None,
            rpc_responses: None,
            application: None,
            messages: MessageRegistry::new(),
            transport_kind: TransportKind::Tcp,
            session_supervisor: None,
            actor_supervisor: None,
        }
    }

    /// This node's address
    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    /// Effective configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Membership provider
    pub fn membership(&self) -> &Arc<dyn MembershipProvider> {
        &self.membership
    }

    /// Entity router
    pub fn router(&self) -> &EntityRouter {
        &self.router
    }

    /// Local entity actors
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Session manager
    pub fn manager(&self) -> &Addr<SessionManager> {
        &self.manager
    }

    /// Message kinds this node accepts
    pub fn messages(&self) -> &MessageRegistry {
        &self.messages
    }

    /// Address the TCP listener is bound to
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|listener| listener.local_addr())
    }

    /// Deliver a message to the actor of `msg.entity_id`, wherever it lives
    pub fn send_to_entity(&self, msg: ToEntityMsg) -> ClusterResult<()> {
        let owner = self.router.owner(&msg.entity_id);
        if owner == self.local {
            self.registry.tell(msg);
            return Ok(());
        }
        debug!("[{}] Forwarding message for entity {} to {}", self.local, msg.entity_id, owner);
        let payload = MessageRegistry::encode(&msg)?;
        self.client.send_to_cluster(Some(owner), payload)
    }

    /// Send a raw payload to `target`, or to every peer when `None`.
    /// A payload addressed to this node is dispatched locally.
    pub fn send_to_cluster(&self, target: Option<PeerAddress>, payload: Bytes) -> ClusterResult<()> {
        if target.as_ref() == Some(&self.local) {
            return self.dispatcher.on_cluster_message(&self.local, payload);
        }
        self.client.send_to_cluster(target, payload)
    }

    /// Encode and send a registered message
    pub fn send_message<T: WireMessage>(&self, target: Option<PeerAddress>, message: &T) -> ClusterResult<()> {
        self.send_to_cluster(target, MessageRegistry::encode(message)?)
    }

    /// Current session state
    pub async fn session_snapshot(&self) -> ClusterResult<SessionSnapshot> {
        Ok(self.manager.send(GetSessionSnapshot).await?)
    }

    /// Stop accepting sessions, close live ones and stop the node's pools
    pub async fn shutdown(self) {
        info!("[{}] Shutting down cluster node", self.local);
        if let Some(listener) = &self.listener {
            listener.shutdown();
        }
        if let TransportKind::Memory(network) = &self.transport_kind {
            network.unregister(&self.local);
        }
        if self.manager.send(StopSessions).await.is_err() {
            debug!("[{}] Session manager already stopped", self.local);
        }
        self.watcher.do_send(StopRouting);
        for pool in &self.pools {
            pool.stop();
        }
    }
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("local", &self.local)
            .field("transport", &self.transport_kind)
            .field("entities", &self.registry.len())
            .finish()
    }
}
