//! Tagged payload codec.
//!
//! Every application message travels as a frame `{kind, body}` where `kind`
//! is the stable [`WireMessage::KIND`] string and `body` the bincode encoding
//! of the message itself. The set of kinds is open: a [`MessageRegistry`]
//! maps each registered kind to its decoder, so new message types can be
//! added without touching the wire format.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterResult, CodecError};

/// Message that can cross the cluster wire
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Stable tag identifying this message kind on the wire
    const KIND: &'static str;
}

#[derive(Serialize)]
struct FrameRef<'a> {
    kind: &'a str,
    body: &'a [u8],
}

#[derive(Deserialize)]
struct Frame {
    kind: String,
    body: Vec<u8>,
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>, CodecError>;

fn decode_body<T: WireMessage>(body: &[u8]) -> Result<Box<dyn Any + Send>, CodecError> {
    let value: T = bincode::deserialize(body)?;
    Ok(Box::new(value))
}

/// Payload decoded by a [`MessageRegistry`], not yet bound to a concrete type
pub struct DecodedMessage {
    kind: String,
    value: Box<dyn Any + Send>,
}

impl DecodedMessage {
    /// Wire kind of the message
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether the message is a `T`
    pub fn is<T: WireMessage>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Take the message as a `T`
    pub fn downcast<T: WireMessage>(self) -> Result<T, CodecError> {
        let kind = self.kind;
        self.value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| CodecError::UnexpectedKind {
                expected: T::KIND.to_string(),
                actual: kind,
            })
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage").field("kind", &self.kind).finish()
    }
}

/// Registry of message kinds this node understands
#[derive(Clone, Default)]
pub struct MessageRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl MessageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` so frames tagged `T::KIND` can be decoded
    pub fn register<T: WireMessage>(&mut self) -> &mut Self {
        if self.decoders.insert(T::KIND, decode_body::<T>).is_some() {
            log::warn!("Message kind {} registered twice", T::KIND);
        }
        self
    }

    /// Whether `kind` is registered
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Encode a message into a tagged frame
    pub fn encode<T: WireMessage>(message: &T) -> ClusterResult<Bytes> {
        let body = bincode::serialize(message)?;
        let frame = bincode::serialize(&FrameRef {
            kind: T::KIND,
            body: &body,
        })?;
        Ok(Bytes::from(frame))
    }

    /// Decode a tagged frame into whichever registered kind it carries
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, CodecError> {
        let frame: Frame = bincode::deserialize(bytes)?;
        let decoder = self
            .decoders
            .get(frame.kind.as_str())
            .ok_or_else(|| CodecError::UnknownKind(frame.kind.clone()))?;
        let value = decoder(&frame.body)?;
        Ok(DecodedMessage {
            kind: frame.kind,
            value,
        })
    }

    /// Decode a frame that must carry a `T`
    pub fn decode_as<T: WireMessage>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.decode(bytes)?.downcast::<T>()
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("MessageRegistry").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    impl WireMessage for Ping {
        const KIND: &'static str = "test.ping";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Control {
        Start,
        Stop { reason: Option<String> },
    }

    impl WireMessage for Control {
        const KIND: &'static str = "test.control";
    }

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register::<Ping>().register::<Control>();
        registry
    }

    #[test]
    fn test_round_trip_keeps_kind() {
        let registry = registry();
        let ping = Ping {
            seq: 7,
            note: "hello".to_string(),
        };
        let decoded = registry.decode(&MessageRegistry::encode(&ping).unwrap()).unwrap();
        assert_eq!(decoded.kind(), Ping::KIND);
        assert!(decoded.is::<Ping>());
        assert_eq!(decoded.downcast::<Ping>().unwrap(), ping);

        let stop = Control::Stop {
            reason: Some("shutdown".to_string()),
        };
        let bytes = MessageRegistry::encode(&stop).unwrap();
        assert_eq!(registry.decode_as::<Control>(&bytes).unwrap(), stop);
    }

    #[test]
    fn test_unknown_kind() {
        let mut registry = MessageRegistry::new();
        registry.register::<Ping>();
        let bytes = MessageRegistry::encode(&Control::Start).unwrap();
        assert_eq!(
            registry.decode(&bytes).unwrap_err(),
            CodecError::UnknownKind(Control::KIND.to_string())
        );
    }

    #[test]
    fn test_wrong_downcast() {
        let registry = registry();
        let bytes = MessageRegistry::encode(&Control::Start).unwrap();
        match registry.decode_as::<Ping>(&bytes) {
            Err(CodecError::UnexpectedKind { expected, actual }) => {
                assert_eq!(expected, Ping::KIND);
                assert_eq!(actual, Control::KIND);
            }
            other => panic!("Expected UnexpectedKind, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_and_truncated_input() {
        let registry = registry();
        let bytes = MessageRegistry::encode(&Ping {
            seq: 1,
            note: "abc".to_string(),
        })
        .unwrap();

        assert!(matches!(
            registry.decode(&bytes[..bytes.len() - 2]),
            Err(CodecError::Truncated(_))
        ));
        assert!(registry.decode(&[]).is_err());

        // kind length prefix claims far more bytes than exist
        let garbage = [0xffu8; 12];
        assert!(registry.decode(&garbage).is_err());
    }
}
