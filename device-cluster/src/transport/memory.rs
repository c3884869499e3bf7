//! In-process transport.
//!
//! Nodes register their [`SessionBridge`] with a shared [`MemoryNetwork`];
//! a [`MemoryConnector`] opens sessions by wiring two handles together with
//! a pump task per direction. Frames are still encoded envelopes, so the
//! decode path is the same one TCP uses. Tests can cut a link at any time
//! with [`MemoryNetwork::kill_connections`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{SessionBridge, SessionConnector, SessionRequest};
use crate::node::PeerAddress;
use crate::session::{SessionCommand, SessionHandle};

/// Shared registry of in-process nodes and the links between them
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<PeerAddress, SessionBridge>,
    links: HashMap<u64, Arc<MemoryLink>>,
    attempts: HashMap<(PeerAddress, PeerAddress), usize>,
    next_link: u64,
}

impl MemoryNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `address` reachable; inbound sessions are reported to `bridge`
    pub fn register(&self, address: PeerAddress, bridge: SessionBridge) {
        debug!("[{}] Registered on memory network", address);
        self.inner.lock().nodes.insert(address, bridge);
    }

    /// Make `address` unreachable and cut every link it has
    pub fn unregister(&self, address: &PeerAddress) {
        self.inner.lock().nodes.remove(address);
        self.kill_matching(|link| link.initiator == *address || link.acceptor == *address);
    }

    /// Connector opening sessions from `local`
    pub fn connector(&self, local: PeerAddress) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local,
        }
    }

    /// Cut every live link between `a` and `b`, in either direction.
    /// Returns how many links were cut.
    pub fn kill_connections(&self, a: &PeerAddress, b: &PeerAddress) -> usize {
        self.kill_matching(|link| {
            (link.initiator == *a && link.acceptor == *b) || (link.initiator == *b && link.acceptor == *a)
        })
    }

    /// Number of live links between `a` and `b`
    pub fn connection_count(&self, a: &PeerAddress, b: &PeerAddress) -> usize {
        self.inner
            .lock()
            .links
            .values()
            .filter(|link| {
                (link.initiator == *a && link.acceptor == *b)
                    || (link.initiator == *b && link.acceptor == *a)
            })
            .count()
    }

    /// How many times `from` tried to open a session to `to`
    pub fn connect_attempts(&self, from: &PeerAddress, to: &PeerAddress) -> usize {
        self.inner
            .lock()
            .attempts
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn kill_matching<F: Fn(&MemoryLink) -> bool>(&self, matches: F) -> usize {
        let killed: Vec<Arc<MemoryLink>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .links
                .iter()
                .filter(|(_, link)| matches(link))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| inner.links.remove(&id)).collect()
        };
        for link in &killed {
            debug!(
                "[{}][{}] Killing memory link to {}",
                link.initiator, link.session_id, link.acceptor
            );
            let _ = link.kill.send(true);
        }
        killed.len()
    }

    fn open(&self, request: SessionRequest, initiator_bridge: SessionBridge) {
        let acceptor_bridge = {
            let mut inner = self.inner.lock();
            *inner
                .attempts
                .entry((request.local.clone(), request.remote.clone()))
                .or_insert(0) += 1;
            inner.nodes.get(&request.remote).cloned()
        };
        let acceptor_bridge = match acceptor_bridge {
            Some(bridge) => bridge,
            None => {
                initiator_bridge.on_connect_failed(
                    request.remote,
                    request.session_id,
                    "no node listening at address".to_string(),
                );
                return;
            }
        };

        let (initiator_handle, initiator_rx) = SessionHandle::new(request.session_id, true);
        let (acceptor_handle, acceptor_rx) = SessionHandle::new(request.session_id, false);
        let (kill, kill_rx) = watch::channel(false);

        let link = {
            let mut inner = self.inner.lock();
            inner.next_link += 1;
            let id = inner.next_link;
            let link = Arc::new(MemoryLink {
                id,
                session_id: request.session_id,
                initiator: request.local.clone(),
                acceptor: request.remote.clone(),
                initiator_bridge: initiator_bridge.clone(),
                acceptor_bridge: acceptor_bridge.clone(),
                initiator_handle: initiator_handle.clone(),
                acceptor_handle: acceptor_handle.clone(),
                kill,
                finished: AtomicBool::new(false),
            });
            inner.links.insert(id, link.clone());
            link
        };

        tokio::spawn(pump(
            self.clone(),
            link.clone(),
            initiator_rx,
            kill_rx.clone(),
            acceptor_bridge.clone(),
            request.local.clone(),
        ));
        tokio::spawn(pump(
            self.clone(),
            link,
            acceptor_rx,
            kill_rx,
            initiator_bridge.clone(),
            request.remote.clone(),
        ));

        initiator_bridge.on_connected(request.remote.clone(), initiator_handle);
        acceptor_bridge.on_connected(request.local, acceptor_handle);
    }

    fn forget(&self, id: u64) {
        self.inner.lock().links.remove(&id);
    }
}

/// Opens in-process sessions from one node
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    local: PeerAddress,
}

impl SessionConnector for MemoryConnector {
    fn connect(&self, request: SessionRequest, bridge: SessionBridge) {
        debug!(
            "[{}][{}] Opening memory session from {}",
            request.remote, request.session_id, self.local
        );
        self.network.open(request, bridge);
    }
}

enum LinkEnd {
    Closed,
    Killed,
}

struct MemoryLink {
    id: u64,
    session_id: Uuid,
    initiator: PeerAddress,
    acceptor: PeerAddress,
    initiator_bridge: SessionBridge,
    acceptor_bridge: SessionBridge,
    initiator_handle: SessionHandle,
    acceptor_handle: SessionHandle,
    kill: watch::Sender<bool>,
    finished: AtomicBool,
}

impl MemoryLink {
    /// Report the end of the link to both sides, once
    fn finish(&self, network: &MemoryNetwork, end: LinkEnd) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        network.forget(self.id);
        let _ = self.kill.send(true);
        match end {
            LinkEnd::Closed => {
                self.initiator_bridge
                    .on_disconnected(self.acceptor.clone(), &self.initiator_handle);
                self.acceptor_bridge
                    .on_disconnected(self.initiator.clone(), &self.acceptor_handle);
            }
            LinkEnd::Killed => {
                let reason = "memory link killed".to_string();
                self.initiator_bridge.on_error(
                    self.acceptor.clone(),
                    &self.initiator_handle,
                    reason.clone(),
                );
                self.acceptor_bridge
                    .on_error(self.initiator.clone(), &self.acceptor_handle, reason);
            }
        }
    }
}

/// Move envelopes written on one end to the bridge of the other end
async fn pump(
    network: MemoryNetwork,
    link: Arc<MemoryLink>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut kill: watch::Receiver<bool>,
    deliver_to: SessionBridge,
    from: PeerAddress,
) {
    let end = loop {
        tokio::select! {
            biased;
            changed = kill.changed() => {
                if changed.is_err() || *kill.borrow() {
                    break LinkEnd::Killed;
                }
            }
            command = commands.recv() => match command {
                Some(SessionCommand::Send(envelope)) => match envelope.encode() {
                    Ok(frame) => {
                        deliver_to.on_frame(from.clone(), link.session_id, frame);
                    }
                    Err(e) => warn!("[{}][{}] Dropping unencodable envelope: {}", from, link.session_id, e),
                },
                Some(SessionCommand::Close) | None => break LinkEnd::Closed,
            },
        }
    };
    link.finish(&network, end);
}
