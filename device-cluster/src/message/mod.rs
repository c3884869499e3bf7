//! Wire messages exchanged between cluster nodes.
//!
//! Two layers live here. [`codec`] turns application messages (device
//! messages, RPC outcomes, anything registered by the embedding application)
//! into tagged payload bytes. [`envelope`] wraps such a payload together with
//! its destination and a coarse [`MessageType`] into the [`ClusterEnvelope`]
//! that sessions carry. Session-control envelopes (the connect handshake)
//! reuse the same wrapper with a payload that is not an application message.

pub mod codec;
pub mod envelope;

pub use codec::{DecodedMessage, MessageRegistry, WireMessage};
pub use envelope::{ClusterEnvelope, ConnectRequest, MessageType};
