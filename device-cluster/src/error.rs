//! Error types for the device-cluster crate.

use std::io;

use actix::MailboxError;
use thiserror::Error;

use crate::entity::EntityId;

/// Main error type for cluster operations
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Failed to parse a `host:port` peer address
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Payload or frame could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Entity actor stopped or never started
    #[error("Entity actor not available: {0}")]
    EntityUnavailable(EntityId),

    /// Mailbox error
    #[error("Mailbox error: {0}")]
    MailboxError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Type alias for Result with ClusterError
pub type ClusterResult<T> = Result<T, ClusterError>;

impl From<MailboxError> for ClusterError {
    fn from(err: MailboxError) -> Self {
        ClusterError::MailboxError(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::SerializationError(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClusterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClusterError::ChannelClosed
    }
}

/// Failure to turn bytes back into a message.
///
/// Decode failures never tear down a session: callers log the error and drop
/// the offending frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before a complete value was read
    #[error("Truncated input: {0}")]
    Truncated(String),

    /// Input bytes are not a valid encoding
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Frame carries a message kind nobody registered
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    /// Payload decoded but was not the expected message kind
    #[error("Unexpected message kind: expected {expected}, got {actual}")]
    UnexpectedKind {
        /// Kind the caller asked for
        expected: String,
        /// Kind found in the frame
        actual: String,
    },
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(ref io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
                CodecError::Truncated(io_err.to_string())
            }
            ref other => CodecError::Malformed(other.to_string()),
        }
    }
}

/// Error raised while an entity actor processes a message.
///
/// The kind decides how the supervising layer reacts: transient failures are
/// absorbed (the actor resumes with its state intact), fatal ones stop the
/// actor straight away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// A collaborator (DAO, transport) call failed
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Message handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Actor state can no longer be trusted
    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl ProcessingError {
    /// Whether this failure must stop the actor regardless of its budget
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessingError::Fatal(_))
    }
}

/// Returned by a collaborator when the entity's stored state is inconsistent.
///
/// Any other collaborator error is treated as transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Entity state corrupted: {0}")]
pub struct EntityStateCorrupted(pub String);

impl From<anyhow::Error> for ProcessingError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<EntityStateCorrupted>().is_some() {
            return ProcessingError::Fatal(format!("{:#}", err));
        }
        ProcessingError::Transient(format!("{:#}", err))
    }
}
