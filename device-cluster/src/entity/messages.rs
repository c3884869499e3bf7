//! Messages understood by device actors and the values they emit.

use actix::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::services::DeviceMetadata;
use crate::entity::{EntityId, SessionId, TenantId};
use crate::message::{MessageRegistry, WireMessage};
use crate::node::PeerAddress;

/// Attribute scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeScope {
    /// Reported by the device itself
    Client,
    /// Owned by the platform, invisible to the device
    Server,
    /// Owned by the platform, visible to the device
    Shared,
}

/// Correlation key of a device-initiated RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientRpcKey {
    /// Session the request arrived on
    pub session_id: SessionId,
    /// Request id chosen by the device
    pub request_id: i32,
}

/// Already-decoded message from a device transport session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportMsg {
    /// Session opened
    SessionOpen,
    /// Session closed by the transport
    SessionClose,
    /// (Un)subscribe the session from attribute updates
    SubscribeAttributes {
        /// Remove instead of add the subscription
        unsubscribe: bool,
    },
    /// (Un)subscribe the session from server-side RPC
    SubscribeRpc {
        /// Remove instead of add the subscription
        unsubscribe: bool,
    },
    /// Telemetry as a JSON object
    PostTelemetry {
        /// Device-side timestamp in ms; server time when absent
        ts: Option<i64>,
        /// JSON object of key/value pairs
        payload: String,
    },
    /// Client attributes as a JSON object
    PostAttributes {
        /// JSON object of key/value pairs
        payload: String,
    },
    /// Attribute read request
    GetAttributes {
        /// Device-side request id echoed in the response
        request_id: i32,
        /// Client attribute keys, empty for all
        client_keys: Vec<String>,
        /// Shared attribute keys, empty for all
        shared_keys: Vec<String>,
    },
    /// Device answers a server-side RPC
    ToDeviceRpcResponse {
        /// Sequence number the actor assigned to the request
        request_id: i32,
        /// Response body
        payload: String,
    },
    /// Device issues an RPC to the platform
    ToServerRpcRequest {
        /// Device-side request id
        request_id: i32,
        /// RPC method
        method: String,
        /// JSON parameters
        params: String,
    },
    /// Keep-alive
    Activity,
}

/// Transport message bound to the session it arrived on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportToDevice {
    /// Transport session
    pub session_id: SessionId,
    /// Decoded message
    pub msg: TransportMsg,
}

/// Platform-to-device RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceRpcRequest {
    /// Platform request id, used to correlate the outcome
    pub id: Uuid,
    /// Fire and forget
    pub oneway: bool,
    /// Absolute deadline, ms since the epoch
    pub expiration_time: i64,
    /// RPC method
    pub method: String,
    /// JSON parameters
    pub params: String,
    /// Node that should receive the outcome; `None` means the local node
    pub origin: Option<PeerAddress>,
}

/// Why an RPC did not produce a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    /// No transport session is subscribed to RPC
    DeviceUnreachable,
    /// The deadline passed first
    Timeout,
    /// The request failed for another reason
    Failed(String),
}

/// Message processed by a [`DeviceActor`](super::DeviceActor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
#[rtype(result = "ProcessOutcome")]
pub enum DeviceActorMsg {
    /// Message from a device transport session
    Transport(TransportToDevice),
    /// Attributes changed outside the device
    AttributesUpdated {
        /// Scope of the changed keys
        scope: AttributeScope,
        /// Changed keys; empty means the whole scope
        keys: Vec<String>,
        /// Keys were deleted rather than updated
        deleted: bool,
    },
    /// Device credentials changed
    CredentialsUpdated,
    /// Device name or type changed
    NameOrTypeUpdated {
        /// New name
        name: String,
        /// New type
        device_type: String,
    },
    /// Platform-to-device RPC
    ToDeviceRpcRequest(ToDeviceRpcRequest),
    /// Deadline of a platform-to-device RPC elapsed
    ServerSideRpcTimeout {
        /// Actor-assigned sequence number
        request_id: i32,
    },
    /// Platform answers a device-to-platform RPC
    ToServerRpcResponse {
        /// Correlation key
        key: ClientRpcKey,
        /// Response body or failure
        result: Result<String, RpcError>,
    },
    /// Deadline of a device-to-platform RPC elapsed
    ClientSideRpcTimeout {
        /// Correlation key
        key: ClientRpcKey,
    },
    /// Periodic stale-session sweep
    SessionTimeoutSweep,
    /// Stop the actor
    Stop,
    /// Application kind this actor does not know
    Custom {
        /// Kind tag
        kind: String,
        /// Opaque payload
        payload: Vec<u8>,
    },
}

/// Whether an actor recognised a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, MessageResponse)]
pub enum ProcessOutcome {
    /// Message was dispatched
    Handled,
    /// Message kind is not handled by this actor
    Unhandled,
}

/// Message addressed to an entity, local or remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToEntityMsg {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Target entity
    pub entity_id: EntityId,
    /// Payload for the entity actor
    pub msg: DeviceActorMsg,
}

impl ToEntityMsg {
    /// Address `msg` to an entity
    pub fn new(tenant_id: TenantId, entity_id: EntityId, msg: DeviceActorMsg) -> Self {
        ToEntityMsg {
            tenant_id,
            entity_id,
            msg,
        }
    }
}

impl WireMessage for ToEntityMsg {
    const KIND: &'static str = "device.to_entity";
}

/// Outcome of a platform-to-device RPC, routed to the node that issued it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromDeviceRpcResponse {
    /// Platform request id
    pub request_id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Entity that handled the request
    pub entity_id: EntityId,
    /// Response body (`None` for one-way requests) or failure
    pub result: Result<Option<String>, RpcError>,
}

impl WireMessage for FromDeviceRpcResponse {
    const KIND: &'static str = "device.rpc_response";
}

/// Register the built-in device message kinds
pub fn register_kinds(registry: &mut MessageRegistry) {
    registry
        .register::<ToEntityMsg>()
        .register::<FromDeviceRpcResponse>();
}

/// Outbound notification to a device transport session
#[derive(Debug, Clone, PartialEq)]
pub enum ToTransportMsg {
    /// Request accepted
    Ack,
    /// Request failed
    Failure {
        /// Human-readable reason
        reason: String,
    },
    /// Attribute values requested by the device
    AttributesResponse {
        /// Device-side request id
        request_id: i32,
        /// Client attributes
        client: serde_json::Map<String, serde_json::Value>,
        /// Shared attributes
        shared: serde_json::Map<String, serde_json::Value>,
    },
    /// Platform-to-device RPC
    ToDeviceRpcRequest {
        /// Actor-assigned sequence number
        request_id: i32,
        /// RPC method
        method: String,
        /// JSON parameters
        params: String,
    },
    /// Answer to a device-to-platform RPC
    ToServerRpcResponse {
        /// Device-side request id
        request_id: i32,
        /// Response body or failure
        result: Result<String, RpcError>,
    },
    /// The session is closed by the platform
    SessionClose {
        /// Human-readable reason
        reason: String,
    },
}

/// Event forwarded to the rule engine boundary
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Telemetry was persisted
    Telemetry {
        /// Owning tenant
        tenant_id: TenantId,
        /// Device
        entity_id: EntityId,
        /// Device name and type
        metadata: DeviceMetadata,
        /// Timestamp in ms
        ts: i64,
        /// Values
        values: serde_json::Map<String, serde_json::Value>,
    },
    /// Client attributes were persisted
    Attributes {
        /// Owning tenant
        tenant_id: TenantId,
        /// Device
        entity_id: EntityId,
        /// Device name and type
        metadata: DeviceMetadata,
        /// Values
        values: serde_json::Map<String, serde_json::Value>,
    },
    /// Device issued an RPC to the platform
    ToServerRpcRequest {
        /// Owning tenant
        tenant_id: TenantId,
        /// Device
        entity_id: EntityId,
        /// Correlation key for the answer
        key: ClientRpcKey,
        /// RPC method
        method: String,
        /// JSON parameters
        params: String,
    },
}
