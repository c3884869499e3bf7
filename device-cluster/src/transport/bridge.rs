//! Glue between transports and the session manager.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use actix::prelude::*;
use bytes::Bytes;
use futures::FutureExt as _;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ClusterResult;
use crate::message::{ClusterEnvelope, MessageType};
use crate::node::PeerAddress;
use crate::pool::DispatchPool;
use crate::session::{
    SessionClosed, SessionConnectFailed, SessionConnected, SessionDisconnected, SessionHandle,
    SessionManager,
};

/// Application-level consumer of inbound cluster payloads
pub trait InboundHandler: Send + Sync {
    /// Handle the payload of an `ActorMessage` envelope received from `from`
    fn on_cluster_message(&self, from: &PeerAddress, payload: Bytes) -> ClusterResult<()>;
}

/// Converts transport callbacks into session manager messages
#[derive(Clone)]
pub struct SessionBridge {
    manager: Addr<SessionManager>,
    callbacks: Arc<DispatchPool>,
    inbound: Arc<dyn InboundHandler>,
}

impl SessionBridge {
    /// Create a bridge reporting to `manager` and dispatching inbound
    /// payloads to `inbound` on the `callbacks` pool
    pub fn new(
        manager: Addr<SessionManager>,
        callbacks: Arc<DispatchPool>,
        inbound: Arc<dyn InboundHandler>,
    ) -> Self {
        SessionBridge {
            manager,
            callbacks,
            inbound,
        }
    }

    /// Session manager this bridge reports to
    pub fn manager(&self) -> &Addr<SessionManager> {
        &self.manager
    }

    /// A connection is up and `handle` can carry envelopes
    pub fn on_connected(&self, address: PeerAddress, handle: SessionHandle) {
        debug!(
            "[{}][{}] Transport connected ({})",
            address,
            handle.session_id(),
            if handle.is_outbound() { "outbound" } else { "inbound" }
        );
        self.manager.do_send(SessionConnected { address, handle });
    }

    /// The connection behind `handle` ended cleanly
    pub fn on_disconnected(&self, address: PeerAddress, handle: &SessionHandle) {
        info!("[{}][{}] Transport disconnected", address, handle.session_id());
        self.manager.do_send(SessionDisconnected {
            address,
            session_id: handle.session_id(),
            connection_id: handle.connection_id(),
        });
    }

    /// The connection behind `handle` failed: force it closed, then report it
    pub fn on_error(&self, address: PeerAddress, handle: &SessionHandle, error: String) {
        error!(
            "[{}][{}] Transport error, closing session: {}",
            address,
            handle.session_id(),
            error
        );
        handle.close();
        self.manager.do_send(SessionClosed {
            address,
            session_id: handle.session_id(),
            connection_id: handle.connection_id(),
            error,
        });
    }

    /// An outbound connect attempt failed
    pub fn on_connect_failed(&self, address: PeerAddress, session_id: Uuid, error: String) {
        warn!("[{}][{}] Failed to connect: {}", address, session_id, error);
        self.manager.do_send(SessionConnectFailed {
            address,
            session_id,
            error,
        });
    }

    /// A frame arrived from `from`.
    ///
    /// Decoding and dispatch run on the callback pool, pinned per peer so
    /// frames from one peer are handled in arrival order. A frame that fails
    /// to decode, or whose handler fails, is logged and dropped; the session
    /// stays up.
    pub fn on_frame(&self, from: PeerAddress, session_id: Uuid, frame: Bytes) {
        let inbound = self.inbound.clone();
        let key = from.clone();
        let work = async move {
            let envelope = match ClusterEnvelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("[{}][{}] Dropping undecodable frame: {}", from, session_id, e);
                    return;
                }
            };
            match envelope.message_type {
                MessageType::ActorMessage => {
                    if let Err(e) = inbound.on_cluster_message(&from, envelope.payload) {
                        warn!("[{}][{}] Dropping inbound message: {}", from, session_id, e);
                    }
                }
                MessageType::Connect => {
                    warn!("[{}][{}] Unexpected handshake on established session", from, session_id);
                }
            }
        };
        self.callbacks.spawn_keyed(
            &key,
            AssertUnwindSafe(work).catch_unwind().map(|result| {
                if result.is_err() {
                    error!("Inbound message handler panicked");
                }
            }),
        );
    }
}
