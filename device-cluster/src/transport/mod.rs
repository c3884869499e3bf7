//! Transports carrying cluster sessions.
//!
//! A transport only moves frames. Everything it observes (a connection coming
//! up, going down, failing, or delivering a frame) is reported through the
//! [`SessionBridge`], which owns the translation into session manager
//! messages and the hand-off of inbound payloads to the callback pool.

use uuid::Uuid;

use crate::node::PeerAddress;

pub mod bridge;
pub mod memory;
pub mod tcp;

pub use bridge::{InboundHandler, SessionBridge};
pub use memory::{MemoryConnector, MemoryNetwork};
pub use tcp::{TcpConnector, TcpSessionListener};

/// Request to open an outbound session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Session id the manager assigned
    pub session_id: Uuid,
    /// This node
    pub local: PeerAddress,
    /// Peer to connect to
    pub remote: PeerAddress,
}

/// Opens outbound sessions.
///
/// `connect` returns immediately; the outcome is reported later through the
/// bridge as either `on_connected` or `on_connect_failed`.
pub trait SessionConnector: Send + Sync {
    /// Start connecting to `request.remote`
    fn connect(&self, request: SessionRequest, bridge: SessionBridge);
}
