//! Client error types.

use mongowire_protocol::{Document, ErrorKind, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    /// The server set reply flags; `error` is the document it sent back.
    #[error("query failed (flags {flags:#x}): {error}")]
    QueryFailure { flags: i32, error: Document },

    /// A command reply whose `ok` field was not 1.
    #[error("command {command:?} failed: {result}")]
    CommandFailed { command: String, result: Document },

    /// A reply that parsed but lacks fields the operation needs.
    #[error("malformed reply ({reason}): {document}")]
    MalformedReply {
        reason: &'static str,
        document: Document,
    },

    #[error("reply answers request {actual}, expected {expected}")]
    ResponseMismatch { expected: i32, actual: i32 },

    #[error("expected a reply, got opcode {0}")]
    UnexpectedOpCode(i32),

    #[error("cursor is closed")]
    CursorClosed,

    /// A document handed to an insert breaks the key rules.
    #[error("document {index} of the insert is invalid: {source}")]
    InvalidDocument {
        index: usize,
        #[source]
        source: ProtocolError,
    },
}

impl ClientError {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Io(_)
            | ClientError::Timeout
            | ClientError::NotConnected
            | ClientError::ConnectionClosed => ErrorKind::Transport,
            ClientError::Protocol(e) => e.kind(),
            ClientError::QueryFailure { .. }
            | ClientError::CommandFailed { .. }
            | ClientError::MalformedReply { .. }
            | ClientError::ResponseMismatch { .. }
            | ClientError::UnexpectedOpCode(_) => ErrorKind::Protocol,
            ClientError::CursorClosed | ClientError::InvalidDocument { .. } => {
                ErrorKind::Validation
            }
        }
    }

    /// Returns whether the caller may reasonably retry.
    ///
    /// The client itself never retries or reconnects.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Timeout)
    }

    /// The server's diagnostic document, for query and command failures.
    pub fn server_document(&self) -> Option<&Document> {
        match self {
            ClientError::QueryFailure { error, .. } => Some(error),
            ClientError::CommandFailed { result, .. } => Some(result),
            ClientError::MalformedReply { document, .. } => Some(document),
            _ => None,
        }
    }
}
