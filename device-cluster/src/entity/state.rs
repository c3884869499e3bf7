//! State owned by a single device actor.
//!
//! Nothing here is shared: the actor mutates it from its own mailbox only.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::entity::messages::{AttributeScope, ClientRpcKey, ToDeviceRpcRequest};
use crate::entity::services::{DeviceMetadata, KvMap};
use crate::entity::{EntityId, SessionId, TenantId};

/// Transport session bound to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    /// Receives attribute update notifications
    pub subscribed_attributes: bool,
    /// Receives server-side RPC requests
    pub subscribed_rpc: bool,
    /// Last message seen on the session
    pub last_activity: Instant,
}

impl SessionBinding {
    fn new(now: Instant) -> Self {
        SessionBinding {
            subscribed_attributes: false,
            subscribed_rpc: false,
            last_activity: now,
        }
    }
}

/// Outstanding platform-to-device RPC
#[derive(Debug, Clone, PartialEq)]
pub struct PendingServerRpc {
    /// Original request
    pub request: ToDeviceRpcRequest,
}

impl PendingServerRpc {
    /// Deadline, ms since the epoch
    pub fn deadline(&self) -> i64 {
        self.request.expiration_time
    }
}

/// Per-device state
#[derive(Debug)]
pub struct DeviceState {
    tenant_id: TenantId,
    entity_id: EntityId,
    sessions: HashMap<SessionId, SessionBinding>,
    server_rpc: HashMap<i32, PendingServerRpc>,
    client_rpc: HashMap<ClientRpcKey, i64>,
    rpc_seq: i32,
    metadata: Option<DeviceMetadata>,
    attributes: HashMap<(AttributeScope, String), Value>,
}

impl DeviceState {
    /// Empty state for an entity
    pub fn new(tenant_id: TenantId, entity_id: EntityId) -> Self {
        DeviceState {
            tenant_id,
            entity_id,
            sessions: HashMap::new(),
            server_rpc: HashMap::new(),
            client_rpc: HashMap::new(),
            rpc_seq: 0,
            metadata: None,
            attributes: HashMap::new(),
        }
    }

    /// Owning tenant
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Entity id
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    // ---- sessions ----

    /// Bind a session, evicting the least recently active one if the device
    /// is already at `max_sessions`; returns the evicted session
    pub fn open_session(
        &mut self,
        session_id: SessionId,
        now: Instant,
        max_sessions: usize,
    ) -> Option<SessionId> {
        if let Some(binding) = self.sessions.get_mut(&session_id) {
            binding.last_activity = now;
            return None;
        }

        let evicted = if self.sessions.len() >= max_sessions {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, binding)| binding.last_activity)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                self.close_session(&id);
            }
            oldest
        } else {
            None
        };

        self.sessions.insert(session_id, SessionBinding::new(now));
        evicted
    }

    /// Unbind a session and forget its device-to-platform RPCs
    pub fn close_session(&mut self, session_id: &SessionId) -> bool {
        self.client_rpc.retain(|key, _| key.session_id != *session_id);
        self.sessions.remove(session_id).is_some()
    }

    /// Refresh the session's activity; false if the session is unknown
    pub fn touch(&mut self, session_id: &SessionId, now: Instant) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(binding) => {
                binding.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Binding of a session
    pub fn session(&self, session_id: &SessionId) -> Option<&SessionBinding> {
        self.sessions.get(session_id)
    }

    /// Number of bound sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Toggle the attribute subscription; false if the session is unknown
    pub fn subscribe_attributes(&mut self, session_id: &SessionId, subscribed: bool) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(binding) => {
                binding.subscribed_attributes = subscribed;
                true
            }
            None => false,
        }
    }

    /// Toggle the RPC subscription; false if the session is unknown
    pub fn subscribe_rpc(&mut self, session_id: &SessionId, subscribed: bool) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(binding) => {
                binding.subscribed_rpc = subscribed;
                true
            }
            None => false,
        }
    }

    /// Sessions subscribed to RPC, in a stable order
    pub fn rpc_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, binding)| binding.subscribed_rpc)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Unbind sessions idle for at least `timeout`; returns them
    pub fn sweep_sessions(&mut self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        let mut stale: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, binding)| now.saturating_duration_since(binding.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        stale.sort();
        for id in &stale {
            self.close_session(id);
        }
        stale
    }

    // ---- platform-to-device RPC ----

    /// Next device-facing request id
    pub fn next_rpc_seq(&mut self) -> i32 {
        self.rpc_seq = self.rpc_seq.wrapping_add(1);
        self.rpc_seq
    }

    /// Track a two-way request under `seq`
    pub fn register_server_rpc(&mut self, seq: i32, request: ToDeviceRpcRequest) {
        self.server_rpc.insert(seq, PendingServerRpc { request });
    }

    /// Remove an outstanding request; `None` if it was already resolved
    pub fn take_server_rpc(&mut self, seq: i32) -> Option<PendingServerRpc> {
        self.server_rpc.remove(&seq)
    }

    /// Whether `seq` is still outstanding
    pub fn has_server_rpc(&self, seq: i32) -> bool {
        self.server_rpc.contains_key(&seq)
    }

    /// Remove every outstanding request, oldest sequence first
    pub fn take_all_server_rpcs(&mut self) -> Vec<PendingServerRpc> {
        let mut pending: Vec<_> = self.server_rpc.drain().collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, pending)| pending).collect()
    }

    /// Remove every request whose deadline is at or before `now_ms`
    pub fn take_expired_server_rpcs(&mut self, now_ms: i64) -> Vec<PendingServerRpc> {
        let mut expired: Vec<_> = self
            .server_rpc
            .iter()
            .filter(|(_, pending)| pending.deadline() <= now_ms)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort();
        expired
            .into_iter()
            .filter_map(|seq| self.server_rpc.remove(&seq))
            .collect()
    }

    /// Number of outstanding platform-to-device requests
    pub fn pending_server_rpcs(&self) -> usize {
        self.server_rpc.len()
    }

    // ---- device-to-platform RPC ----

    /// Track a device-issued request until `deadline_ms`
    pub fn register_client_rpc(&mut self, key: ClientRpcKey, deadline_ms: i64) {
        self.client_rpc.insert(key, deadline_ms);
    }

    /// Remove an outstanding device request; false if already resolved
    pub fn take_client_rpc(&mut self, key: &ClientRpcKey) -> bool {
        self.client_rpc.remove(key).is_some()
    }

    /// Remove every device request whose deadline is at or before `now_ms`
    pub fn take_expired_client_rpcs(&mut self, now_ms: i64) -> Vec<ClientRpcKey> {
        let mut expired: Vec<_> = self
            .client_rpc
            .iter()
            .filter(|(_, deadline)| **deadline <= now_ms)
            .map(|(key, _)| *key)
            .collect();
        expired.sort();
        for key in &expired {
            self.client_rpc.remove(key);
        }
        expired
    }

    /// Number of outstanding device-to-platform requests
    pub fn pending_client_rpcs(&self) -> usize {
        self.client_rpc.len()
    }

    // ---- cached metadata and attributes ----

    /// Cached device metadata
    pub fn metadata(&self) -> Option<&DeviceMetadata> {
        self.metadata.as_ref()
    }

    /// Cache device metadata
    pub fn set_metadata(&mut self, metadata: DeviceMetadata) {
        self.metadata = Some(metadata);
    }

    /// Drop cached metadata
    pub fn invalidate_metadata(&mut self) {
        self.metadata = None;
    }

    /// Split `keys` into cached values and keys that must be loaded
    pub fn cached_attributes(&self, scope: AttributeScope, keys: &[String]) -> (KvMap, Vec<String>) {
        let mut found = KvMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match self.attributes.get(&(scope, key.clone())) {
                Some(value) => {
                    found.insert(key.clone(), value.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        (found, missing)
    }

    /// Cache attribute values
    pub fn cache_attributes(&mut self, scope: AttributeScope, values: &KvMap) {
        for (key, value) in values {
            self.attributes.insert((scope, key.clone()), value.clone());
        }
    }

    /// Drop cached attributes; an empty key list drops the whole scope
    pub fn invalidate_attributes(&mut self, scope: AttributeScope, keys: &[String]) {
        if keys.is_empty() {
            self.attributes.retain(|(cached_scope, _), _| *cached_scope != scope);
        } else {
            for key in keys {
                self.attributes.remove(&(scope, key.clone()));
            }
        }
    }
}
