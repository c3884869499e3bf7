//! Envelope carried by cluster sessions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClusterResult, CodecError};
use crate::node::PeerAddress;

/// Coarse type tag of a cluster envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Session handshake; payload is an encoded [`ConnectRequest`]
    Connect,
    /// Application message; payload is a tagged [`WireMessage`](super::WireMessage) frame
    ActorMessage,
}

/// First frame on every connection, sent by the connecting side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Address of the connecting node
    pub sender: PeerAddress,
    /// Session id both ends use for this session
    pub session_id: Uuid,
}

/// Unit of wire transfer between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEnvelope {
    /// Target node, `None` for a broadcast
    pub destination: Option<PeerAddress>,
    /// Envelope kind
    pub message_type: MessageType,
    /// Opaque payload
    pub payload: Bytes,
}

impl ClusterEnvelope {
    /// Wrap an application payload addressed to `destination` (or everyone)
    pub fn actor_message(destination: Option<PeerAddress>, payload: Bytes) -> Self {
        ClusterEnvelope {
            destination,
            message_type: MessageType::ActorMessage,
            payload,
        }
    }

    /// Handshake envelope announcing `sender` as the origin of a connection
    pub fn connect(sender: &PeerAddress, session_id: Uuid) -> ClusterResult<Self> {
        let payload = bincode::serialize(&ConnectRequest {
            sender: sender.clone(),
            session_id,
        })?;
        Ok(ClusterEnvelope {
            destination: None,
            message_type: MessageType::Connect,
            payload: Bytes::from(payload),
        })
    }

    /// Handshake carried by a `Connect` envelope
    pub fn connect_request(&self) -> Result<ConnectRequest, CodecError> {
        if self.message_type != MessageType::Connect {
            return Err(CodecError::UnexpectedKind {
                expected: "Connect".to_string(),
                actual: format!("{:?}", self.message_type),
            });
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Copy of this envelope addressed to `destination`
    pub fn addressed_to(&self, destination: PeerAddress) -> Self {
        ClusterEnvelope {
            destination: Some(destination),
            message_type: self.message_type,
            payload: self.payload.clone(),
        }
    }

    /// Whether the envelope targets every peer
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }

    /// Encode the envelope to frame bytes
    pub fn encode(&self) -> ClusterResult<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode an envelope from frame bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_encode_decode() {
        let envelope = ClusterEnvelope::actor_message(
            Some(PeerAddress::new("10.0.0.2", 7070)),
            Bytes::from_static(b"payload"),
        );
        let bytes = envelope.encode().unwrap();
        assert_eq!(ClusterEnvelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_connect_envelope_carries_sender() {
        let sender = PeerAddress::new("10.0.0.1", 7070);
        let session_id = Uuid::new_v4();
        let envelope = ClusterEnvelope::connect(&sender, session_id).unwrap();
        assert!(envelope.is_broadcast());
        let request = envelope.connect_request().unwrap();
        assert_eq!(request.sender, sender);
        assert_eq!(request.session_id, session_id);

        let data = ClusterEnvelope::actor_message(None, Bytes::new());
        assert!(matches!(
            data.connect_request(),
            Err(CodecError::UnexpectedKind { .. })
        ));
    }

    #[test]
    fn test_truncated_envelope_is_typed_failure() {
        let envelope = ClusterEnvelope::actor_message(None, Bytes::from_static(b"0123456789"));
        let bytes = envelope.encode().unwrap();
        let err = ClusterEnvelope::decode(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated(_)));
    }

    #[test]
    fn test_addressed_copy_shares_payload() {
        let envelope = ClusterEnvelope::actor_message(None, Bytes::from_static(b"m"));
        let peer = PeerAddress::new("10.0.0.3", 7070);
        let copy = envelope.addressed_to(peer.clone());
        assert_eq!(copy.destination, Some(peer));
        assert_eq!(copy.payload, envelope.payload);
        assert!(envelope.is_broadcast());
    }
}
