//! Entity ownership across the cluster.
//!
//! Ownership is decided with a consistent-hash ring over every core node,
//! each contributing a fixed number of virtual nodes, so a membership change
//! only moves the entities that hashed next to the joining or leaving node.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use actix::prelude::*;
use fnv::FnvHasher;
use log::{debug, info};
use parking_lot::RwLock;

use crate::entity::{EntityId, EntityRegistry};
use crate::membership::{MembershipEvent, MembershipProvider};
use crate::node::{NodeRole, PeerAddress};

fn fnv_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FnvHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Consistent-hash router from entity id to owning node
#[derive(Clone)]
pub struct EntityRouter {
    local: PeerAddress,
    virtual_nodes: usize,
    ring: Arc<RwLock<BTreeMap<u64, PeerAddress>>>,
}

impl EntityRouter {
    /// Build a ring over `local` and `members`
    pub fn new<'a>(
        local: PeerAddress,
        members: impl IntoIterator<Item = &'a PeerAddress>,
        virtual_nodes: usize,
    ) -> Self {
        let router = EntityRouter {
            local,
            virtual_nodes: virtual_nodes.max(1),
            ring: Arc::new(RwLock::new(BTreeMap::new())),
        };
        router.rebuild(members);
        router
    }

    /// Replace the ring contents; this node is always on the ring.
    /// Only core nodes own entities.
    pub fn rebuild<'a>(&self, members: impl IntoIterator<Item = &'a PeerAddress>) {
        let mut nodes: BTreeSet<&PeerAddress> = members
            .into_iter()
            .filter(|addr| addr.role == NodeRole::Core)
            .collect();
        nodes.insert(&self.local);

        let mut ring = BTreeMap::new();
        for node in &nodes {
            for vnode in 0..self.virtual_nodes {
                ring.insert(fnv_hash(&(&node.host, node.port, vnode as u64)), (*node).clone());
            }
        }
        debug!(
            "[{}] Routing ring rebuilt with {} node(s), {} point(s)",
            self.local,
            nodes.len(),
            ring.len()
        );
        *self.ring.write() = ring;
    }

    /// Node owning `entity_id`
    pub fn owner(&self, entity_id: &EntityId) -> PeerAddress {
        let point = fnv_hash(entity_id.as_uuid().as_bytes());
        let ring = self.ring.read();
        ring.range(point..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, addr)| addr.clone())
            .unwrap_or_else(|| self.local.clone())
    }

    /// Whether this node owns `entity_id`
    pub fn is_local(&self, entity_id: &EntityId) -> bool {
        self.owner(entity_id) == self.local
    }

    /// This node's address
    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    /// Distinct nodes on the ring
    pub fn nodes(&self) -> BTreeSet<PeerAddress> {
        self.ring.read().values().cloned().collect()
    }
}

/// Keeps the router in step with membership and stops actors whose entities
/// moved to another node
pub struct RoutingWatcher {
    router: EntityRouter,
    registry: EntityRegistry,
    membership: Arc<dyn MembershipProvider>,
}

impl RoutingWatcher {
    /// Create a watcher
    pub fn new(
        router: EntityRouter,
        registry: EntityRegistry,
        membership: Arc<dyn MembershipProvider>,
    ) -> Self {
        RoutingWatcher {
            router,
            registry,
            membership,
        }
    }
}

impl Actor for RoutingWatcher {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.membership.subscribe(ctx.address().recipient());
        self.router.rebuild(&self.membership.other_members());
    }
}

impl Handler<MembershipEvent> for RoutingWatcher {
    type Result = ();

    fn handle(&mut self, msg: MembershipEvent, _ctx: &mut Self::Context) {
        debug!("[{}] Rebalancing after {:?}", self.router.local(), msg);
        self.router.rebuild(&self.membership.other_members());
        let router = self.router.clone();
        let moved = self.registry.retain(|entity_id| router.is_local(entity_id));
        if !moved.is_empty() {
            info!(
                "[{}] Stopped {} actor(s) whose entities moved to other nodes",
                self.router.local(),
                moved.len()
            );
        }
    }
}

/// Stop a [`RoutingWatcher`]
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct StopRouting;

impl Handler<StopRouting> for RoutingWatcher {
    type Result = ();

    fn handle(&mut self, _msg: StopRouting, ctx: &mut Self::Context) {
        ctx.stop();
    }
}
