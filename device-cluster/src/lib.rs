//! Clustered device actors on Actix
//!
//! This crate hosts one actor per managed device and keeps point-to-point RPC
//! sessions between the nodes of a cluster. Messages for a device are routed
//! to the node that owns it; messages for a peer without a live session are
//! queued until one registers.

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]
#![warn(missing_docs)]

pub mod config;
pub mod entity;
pub mod error;
pub mod membership;
pub mod message;
pub mod node;
pub mod pool;
pub mod routing;
pub mod service;
pub mod session;
pub mod supervision;
pub mod transport;

pub use config::{ClusterConfig, RetryPolicy};
pub use entity::{
    DeviceActor, DeviceActorMsg, DeviceDao, DeviceEvent, DeviceEventSink, EntityId,
    EntityRegistry, FromDeviceRpcResponse, RpcResponseSink, SessionId, TenantId, ToEntityMsg,
    TransportService,
};
pub use error::{ClusterError, ClusterResult, CodecError, EntityStateCorrupted, ProcessingError};
pub use membership::{MembershipEvent, MembershipProvider, StaticMembership};
pub use message::{ClusterEnvelope, MessageRegistry, MessageType, WireMessage};
pub use node::{NodeRole, PeerAddress};
pub use routing::EntityRouter;
pub use service::{ClusterNode, ClusterNodeBuilder, TransportKind};
pub use session::{SessionManager, SessionSnapshot};
pub use supervision::{ActorFault, SessionFault};
pub use transport::{MemoryNetwork, SessionBridge};

/// Re-exports from the actix crate
pub mod prelude {
    pub use actix::prelude::*;
    pub use crate::{
        ClusterConfig, ClusterNode, DeviceActorMsg, EntityId, MembershipProvider, PeerAddress,
        SessionId, StaticMembership, TenantId, ToEntityMsg, WireMessage,
    };
}
