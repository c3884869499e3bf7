//! Entity registry: entity id to actor address.
//!
//! Actors are spawned lazily on the entity dispatch pool and removed when they
//! stop. The map is the only state shared across threads on the entity side,
//! and it holds nothing but addresses.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use actix::prelude::*;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};

use crate::entity::actor::DeviceActor;
use crate::entity::messages::{DeviceActorMsg, ProcessOutcome, ToEntityMsg};
use crate::entity::services::EntityServices;
use crate::entity::{EntityId, TenantId};
use crate::error::{ClusterError, ClusterResult};
use crate::pool::DispatchPool;
use crate::supervision::ActorFault;

const MAX_RECENT_FAULTS: usize = 128;

/// Registry of live device actors on this node
#[derive(Clone)]
pub struct EntityRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    actors: RwLock<HashMap<EntityId, Addr<DeviceActor>>>,
    services: EntityServices,
    pool: Arc<DispatchPool>,
    fault_listener: RwLock<Option<Recipient<ActorFault>>>,
    recent_faults: Mutex<VecDeque<ActorFault>>,
}

/// Back-reference actors use to report their lifecycle to the registry
#[derive(Clone)]
pub(crate) struct RegistryHandle(Weak<RegistryInner>);

impl RegistryHandle {
    pub(crate) fn unregister(&self, entity_id: EntityId, addr: &Addr<DeviceActor>) {
        if let Some(inner) = self.0.upgrade() {
            let mut actors = inner.actors.write();
            if actors.get(&entity_id) == Some(addr) {
                actors.remove(&entity_id);
                debug!("[{}] Removed from entity registry", entity_id);
            }
        }
    }

    pub(crate) fn report_fault(&self, fault: ActorFault) {
        if let Some(inner) = self.0.upgrade() {
            inner.report_fault(fault);
        }
    }
}

impl RegistryInner {
    fn report_fault(&self, fault: ActorFault) {
        error!(
            "[{}] Entity actor faulted after {} failure(s): {}",
            fault.entity_id, fault.failures, fault.error
        );
        {
            let mut recent = self.recent_faults.lock();
            if recent.len() == MAX_RECENT_FAULTS {
                recent.pop_front();
            }
            recent.push_back(fault.clone());
        }
        if let Some(listener) = self.fault_listener.read().as_ref() {
            listener.do_send(fault);
        }
    }
}

impl EntityRegistry {
    /// Create a registry spawning actors on `pool`
    pub fn new(services: EntityServices, pool: Arc<DispatchPool>) -> Self {
        EntityRegistry {
            inner: Arc::new(RegistryInner {
                actors: RwLock::new(HashMap::new()),
                services,
                pool,
                fault_listener: RwLock::new(None),
                recent_faults: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Forward actor faults to `listener`
    pub fn set_fault_listener(&self, listener: Recipient<ActorFault>) {
        *self.inner.fault_listener.write() = Some(listener);
    }

    /// Faults reported since start, oldest first
    pub fn recent_faults(&self) -> Vec<ActorFault> {
        self.inner.recent_faults.lock().iter().cloned().collect()
    }

    /// Deliver a message to the entity's actor, starting it if needed
    pub fn tell(&self, msg: ToEntityMsg) {
        if let Some(addr) = self.route(&msg) {
            addr.do_send(msg.msg);
        }
    }

    /// Deliver a message and wait for the actor to process it
    pub async fn ask(&self, msg: ToEntityMsg) -> ClusterResult<ProcessOutcome> {
        let entity_id = msg.entity_id;
        match self.route(&msg) {
            Some(addr) => Ok(addr.send(msg.msg).await?),
            None => Err(ClusterError::EntityUnavailable(entity_id)),
        }
    }

    fn route(&self, msg: &ToEntityMsg) -> Option<Addr<DeviceActor>> {
        if msg.msg == DeviceActorMsg::Stop {
            // never spawn an actor only to stop it
            return self.get(&msg.entity_id);
        }
        Some(self.get_or_spawn(msg.tenant_id, msg.entity_id))
    }

    /// Address of a running actor
    pub fn get(&self, entity_id: &EntityId) -> Option<Addr<DeviceActor>> {
        self.inner
            .actors
            .read()
            .get(entity_id)
            .filter(|addr| addr.connected())
            .cloned()
    }

    fn get_or_spawn(&self, tenant_id: TenantId, entity_id: EntityId) -> Addr<DeviceActor> {
        if let Some(addr) = self.get(&entity_id) {
            return addr;
        }

        let mut actors = self.inner.actors.write();
        if let Some(addr) = actors.get(&entity_id).filter(|addr| addr.connected()) {
            return addr.clone();
        }

        let services = self.inner.services.clone();
        let handle = RegistryHandle(Arc::downgrade(&self.inner));
        let arbiter = self.inner.pool.handle_for(&entity_id);
        let addr = DeviceActor::start_in_arbiter(&arbiter, move |_| {
            DeviceActor::new(tenant_id, entity_id, services).with_registry(handle)
        });
        info!("[{}] Started device actor", entity_id);
        actors.insert(entity_id, addr.clone());
        addr
    }

    /// Stop an entity's actor; false if none was running
    pub fn stop(&self, entity_id: &EntityId) -> bool {
        let addr = self.inner.actors.write().remove(entity_id);
        match addr {
            Some(addr) => {
                addr.do_send(DeviceActorMsg::Stop);
                true
            }
            None => false,
        }
    }

    /// Stop every actor whose entity fails `keep`; returns the stopped ids
    pub fn retain<F>(&self, mut keep: F) -> Vec<EntityId>
    where
        F: FnMut(&EntityId) -> bool,
    {
        let stopped: Vec<(EntityId, Addr<DeviceActor>)> = {
            let mut actors = self.inner.actors.write();
            let ids: Vec<EntityId> = actors.keys().filter(|id| !keep(id)).copied().collect();
            ids.into_iter()
                .filter_map(|id| actors.remove(&id).map(|addr| (id, addr)))
                .collect()
        };
        for (entity_id, addr) in &stopped {
            debug!("[{}] Stopping actor no longer owned by this node", entity_id);
            addr.do_send(DeviceActorMsg::Stop);
        }
        stopped.into_iter().map(|(id, _)| id).collect()
    }

    /// Whether an actor is registered for the entity
    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.get(entity_id).is_some()
    }

    /// Number of registered actors
    pub fn len(&self) -> usize {
        self.inner.actors.read().len()
    }

    /// Whether no actor is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
