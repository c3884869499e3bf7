//! Node module for cluster peer identification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeRole {
    /// Core node hosting entity actors
    Core,

    /// Transport node terminating device protocols
    Transport,

    /// Rule engine node
    RuleEngine,
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Core
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Core => write!(f, "core"),
            NodeRole::Transport => write!(f, "transport"),
            NodeRole::RuleEngine => write!(f, "rule-engine"),
        }
    }
}

/// Address of a cluster peer.
///
/// The derived total order (host, then port, then role) is what the session
/// manager uses to decide which side of a pair opens the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Host name or IP
    pub host: String,
    /// Cluster RPC port
    pub port: u16,
    /// Node role
    pub role: NodeRole,
}

impl PeerAddress {
    /// Create a new core peer address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_role(host, port, NodeRole::Core)
    }

    /// Create a peer address with an explicit role
    pub fn with_role(host: impl Into<String>, port: u16, role: NodeRole) -> Self {
        PeerAddress {
            host: host.into(),
            port,
            role,
        }
    }

    /// `host:port` form used to open sockets
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::InvalidPeerAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ClusterError::InvalidPeerAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClusterError::InvalidPeerAddress(s.to_string()))?;
        Ok(PeerAddress::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_parse() {
        let addr: PeerAddress = "10.0.0.1:7070".parse().unwrap();
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 7070);
        assert_eq!(addr.role, NodeRole::Core);
        assert_eq!(addr.to_string(), "10.0.0.1:7070");
    }

    #[test]
    fn test_peer_address_parse_rejects_garbage() {
        assert!("10.0.0.1".parse::<PeerAddress>().is_err());
        assert!(":7070".parse::<PeerAddress>().is_err());
        assert!("host:notaport".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_peer_address_order() {
        let a = PeerAddress::new("10.0.0.1", 7070);
        let b = PeerAddress::new("10.0.0.2", 7070);
        let c = PeerAddress::new("10.0.0.1", 7071);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert!(PeerAddress::new("h", 1) < PeerAddress::with_role("h", 1, NodeRole::Transport));
    }
}
