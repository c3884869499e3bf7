//! Cluster membership: who the other nodes are and when that changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use actix::prelude::*;
use log::{debug, info};
use parking_lot::RwLock;

use crate::node::PeerAddress;

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq, Message)]
#[rtype(result = "()")]
pub enum MembershipEvent {
    /// A peer joined the cluster
    Added(PeerAddress),
    /// A peer left the cluster
    Removed(PeerAddress),
}

impl MembershipEvent {
    /// Address the event is about
    pub fn address(&self) -> &PeerAddress {
        match self {
            MembershipEvent::Added(addr) | MembershipEvent::Removed(addr) => addr,
        }
    }
}

/// Source of truth for cluster membership
pub trait MembershipProvider: Send + Sync {
    /// This node's address
    fn current_node(&self) -> PeerAddress;

    /// Every other live member
    fn other_members(&self) -> BTreeSet<PeerAddress>;

    /// Subscribe to membership changes
    fn subscribe(&self, listener: Recipient<MembershipEvent>);

    /// Whether `address` is currently a member other than this node
    fn is_member(&self, address: &PeerAddress) -> bool {
        self.other_members().contains(address)
    }
}

/// Membership backed by an explicit member list.
///
/// Members are added and removed by the embedding application (or by tests);
/// every change is pushed to the subscribed listeners.
#[derive(Clone)]
pub struct StaticMembership {
    local: PeerAddress,
    inner: Arc<RwLock<StaticMembershipInner>>,
}

#[derive(Default)]
struct StaticMembershipInner {
    members: BTreeSet<PeerAddress>,
    listeners: Vec<Recipient<MembershipEvent>>,
}

impl StaticMembership {
    /// Create a membership view for `local` with the given seed members
    pub fn new(local: PeerAddress, seeds: impl IntoIterator<Item = PeerAddress>) -> Self {
        let members = seeds.into_iter().filter(|addr| *addr != local).collect();
        StaticMembership {
            local,
            inner: Arc::new(RwLock::new(StaticMembershipInner {
                members,
                listeners: Vec::new(),
            })),
        }
    }

    /// Add a member and notify listeners; returns false if already known
    pub fn add_member(&self, address: PeerAddress) -> bool {
        if address == self.local {
            return false;
        }
        let listeners = {
            let mut inner = self.inner.write();
            if !inner.members.insert(address.clone()) {
                return false;
            }
            inner.listeners.clone()
        };
        info!("[{}] Member added", address);
        for listener in listeners {
            listener.do_send(MembershipEvent::Added(address.clone()));
        }
        true
    }

    /// Remove a member and notify listeners; returns false if unknown
    pub fn remove_member(&self, address: &PeerAddress) -> bool {
        let listeners = {
            let mut inner = self.inner.write();
            if !inner.members.remove(address) {
                return false;
            }
            inner.listeners.clone()
        };
        info!("[{}] Member removed", address);
        for listener in listeners {
            listener.do_send(MembershipEvent::Removed(address.clone()));
        }
        true
    }
}

impl MembershipProvider for StaticMembership {
    fn current_node(&self) -> PeerAddress {
        self.local.clone()
    }

    fn other_members(&self) -> BTreeSet<PeerAddress> {
        self.inner.read().members.clone()
    }

    fn subscribe(&self, listener: Recipient<MembershipEvent>) {
        debug!("[{}] Membership listener subscribed", self.local);
        self.inner.write().listeners.push(listener);
    }
}
