//! Collaborators a device actor talks to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::{ClusterConfig, RetryPolicy};
use crate::entity::messages::{AttributeScope, DeviceEvent, FromDeviceRpcResponse, ToTransportMsg};
use crate::entity::{EntityId, SessionId, TenantId};
use crate::error::ClusterResult;
use crate::node::PeerAddress;

/// Device name and type, cached by the actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Device name
    pub name: String,
    /// Device type
    pub device_type: String,
}

/// Key/value map used for attributes and telemetry
pub type KvMap = serde_json::Map<String, serde_json::Value>;

/// Persistence interface for device data.
///
/// Calls for one entity are never concurrent: the owning actor waits for each
/// call to finish before taking its next message. An error wrapping
/// [`EntityStateCorrupted`](crate::error::EntityStateCorrupted) stops the
/// actor at once; any other error counts against its failure budget.
#[async_trait]
pub trait DeviceDao: Send + Sync {
    /// Load name and type of a device
    async fn find_device_metadata(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> anyhow::Result<DeviceMetadata>;

    /// Persist a telemetry sample
    async fn save_telemetry(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        ts: i64,
        values: KvMap,
    ) -> anyhow::Result<()>;

    /// Persist attributes in `scope`
    async fn save_attributes(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        scope: AttributeScope,
        values: KvMap,
    ) -> anyhow::Result<()>;

    /// Read attributes in `scope`; an empty key list reads every attribute
    async fn find_attributes(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        scope: AttributeScope,
        keys: Vec<String>,
    ) -> anyhow::Result<KvMap>;
}

/// Outbound side of the device transport
pub trait TransportService: Send + Sync {
    /// Deliver `msg` to a transport session
    fn send_to_session(&self, session_id: SessionId, msg: ToTransportMsg);
}

/// Rule engine boundary
pub trait DeviceEventSink: Send + Sync {
    /// Accept an event produced by a device actor
    fn on_device_event(&self, event: DeviceEvent);
}

/// Receives RPC outcomes for requests issued on this node
pub trait RpcResponseSink: Send + Sync {
    /// Accept an outcome
    fn on_rpc_response(&self, response: FromDeviceRpcResponse);
}

/// "Send to cluster" interface the actors depend on instead of the session manager
pub trait ClusterSender: Send + Sync {
    /// Address of this node
    fn local_address(&self) -> &PeerAddress;

    /// Hand an encoded payload to the session layer; `None` broadcasts
    fn send_to_cluster(&self, target: Option<PeerAddress>, payload: Bytes) -> ClusterResult<()>;
}

/// Everything a device actor needs, shared by every actor on the node
#[derive(Clone)]
pub struct EntityServices {
    /// Persistence
    pub dao: Arc<dyn DeviceDao>,
    /// Transport outbound
    pub transport: Arc<dyn TransportService>,
    /// Rule engine boundary
    pub events: Arc<dyn DeviceEventSink>,
    /// Local RPC outcome sink
    pub rpc_responses: Arc<dyn RpcResponseSink>,
    /// Cluster outbound
    pub cluster: Arc<dyn ClusterSender>,
    /// Actor tunables
    pub settings: EntitySettings,
}

/// Tunables copied out of [`ClusterConfig`]
#[derive(Debug, Clone, Copy)]
pub struct EntitySettings {
    /// Session inactivity threshold
    pub session_timeout: Duration,
    /// Sweep interval
    pub session_sweep_interval: Duration,
    /// Timeout for device-to-platform RPCs
    pub rpc_timeout: Duration,
    /// Max concurrent sessions per device
    pub max_sessions_per_device: usize,
    /// Failure budget
    pub retry: RetryPolicy,
}

impl From<&ClusterConfig> for EntitySettings {
    fn from(config: &ClusterConfig) -> Self {
        EntitySettings {
            session_timeout: config.session_timeout,
            session_sweep_interval: config.session_sweep_interval,
            rpc_timeout: config.rpc_timeout,
            max_sessions_per_device: config.max_sessions_per_device,
            retry: config.actor_retry,
        }
    }
}

impl Default for EntitySettings {
    fn default() -> Self {
        EntitySettings::from(&ClusterConfig::default())
    }
}
