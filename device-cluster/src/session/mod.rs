//! Point-to-point RPC sessions between cluster nodes.
//!
//! The [`SessionManager`] owns which peer has a live session and what is
//! still waiting to be delivered to peers that do not. Transports report
//! connection lifecycle through the
//! [`SessionBridge`](crate::transport::SessionBridge), which turns it into
//! the control messages defined here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use actix::prelude::*;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::message::ClusterEnvelope;
use crate::node::PeerAddress;

pub mod manager;

pub use manager::SessionManager;

/// Instruction for a session's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Write an envelope
    Send(ClusterEnvelope),
    /// Close the connection
    Close,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle of an established session, owned by the session manager.
///
/// A reconnect reuses the session id, so every handle also carries a
/// connection id unique to the transport connection behind it.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    connection_id: u64,
    outbound: bool,
    link: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Create a handle and the receiver its transport writer drains
    pub fn new(session_id: Uuid, outbound: bool) -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (link, rx) = mpsc::unbounded_channel();
        (
            SessionHandle {
                session_id,
                connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                outbound,
                link,
            },
            rx,
        )
    }

    /// Session id
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Id of the transport connection behind this handle
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether this node opened the session
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Queue an envelope for writing; hands it back if the writer is gone
    pub fn tell(&self, envelope: ClusterEnvelope) -> Result<(), ClusterEnvelope> {
        if let Err(mpsc::error::SendError(SessionCommand::Send(envelope))) =
            self.link.send(SessionCommand::Send(envelope))
        {
            return Err(envelope);
        }
        Ok(())
    }

    /// Ask the writer to close the connection
    pub fn close(&self) {
        let _ = self.link.send(SessionCommand::Close);
    }

    /// Whether the writer has gone away
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// Open an outbound session to `address`
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct CreateSession {
    /// Peer to connect to
    pub address: PeerAddress,
    /// Session id to use
    pub session_id: Uuid,
}

/// A session is established (either direction)
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub struct SessionConnected {
    /// Peer at the other end
    pub address: PeerAddress,
    /// Handle of the new session
    pub handle: SessionHandle,
}

/// A session's connection ended
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct SessionDisconnected {
    /// Peer at the other end
    pub address: PeerAddress,
    /// Session that ended
    pub session_id: Uuid,
    /// Connection that ended
    pub connection_id: u64,
}

/// A session was force-closed after a transport error
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct SessionClosed {
    /// Peer at the other end
    pub address: PeerAddress,
    /// Session that was closed
    pub session_id: Uuid,
    /// Connection that was closed
    pub connection_id: u64,
    /// Transport error
    pub error: String,
}

/// An outbound connect attempt failed before a session was established
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct SessionConnectFailed {
    /// Peer that could not be reached
    pub address: PeerAddress,
    /// Session id of the attempt
    pub session_id: Uuid,
    /// Transport error
    pub error: String,
}

/// Hand an envelope to the session layer; no destination means broadcast
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct SendToCluster(pub ClusterEnvelope);

/// Point-in-time view of the session manager
#[derive(Debug, Clone, Default, PartialEq, Eq, MessageResponse)]
pub struct SessionSnapshot {
    /// Registered sessions
    pub sessions: BTreeMap<PeerAddress, Uuid>,
    /// Outbound attempts not yet established
    pub connecting: BTreeMap<PeerAddress, Uuid>,
    /// Pending queue length per peer
    pub pending: BTreeMap<PeerAddress, usize>,
    /// Peers whose retry budget ran out
    pub abandoned: Vec<PeerAddress>,
    /// Envelopes dropped because a pending queue was full
    pub dropped: u64,
}

/// Ask for a [`SessionSnapshot`]
#[derive(Debug, Clone, Message)]
#[rtype(result = "SessionSnapshot")]
pub struct GetSessionSnapshot;

/// Ask for a copy of a peer's pending queue
#[derive(Debug, Clone, Message)]
#[rtype(result = "Vec<ClusterEnvelope>")]
pub struct GetPendingMessages(pub PeerAddress);

/// Close every session and stop the manager
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct StopSessions;
