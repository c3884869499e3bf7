//! Per-entity actors.
//!
//! Every managed device gets one [`DeviceActor`] that owns the device's
//! transport sessions and outstanding RPC requests. Actors are created lazily
//! by the [`EntityRegistry`] on the first message addressed to an entity and
//! live until they are stopped explicitly, lose ownership, or exhaust their
//! failure budget.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod actor;
pub mod messages;
pub mod registry;
pub mod services;
pub mod state;

pub use actor::DeviceActor;
pub use messages::{
    AttributeScope, ClientRpcKey, DeviceActorMsg, DeviceEvent, FromDeviceRpcResponse,
    ProcessOutcome, RpcError, ToDeviceRpcRequest, ToEntityMsg, ToTransportMsg, TransportMsg,
    TransportToDevice, register_kinds,
};
pub use registry::EntityRegistry;
pub use services::{
    ClusterSender, DeviceDao, DeviceEventSink, DeviceMetadata, EntityServices, EntitySettings,
    KvMap, RpcResponseSink, TransportService,
};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a random id
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a managed entity (typically a device)
    EntityId
);

uuid_id!(
    /// Identifier of the tenant owning an entity
    TenantId
);

uuid_id!(
    /// Identifier of a device transport session
    SessionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parse_and_display() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
