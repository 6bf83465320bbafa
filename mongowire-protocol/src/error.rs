//! Protocol error types and error kinds.

use std::fmt;
use thiserror::Error;

/// Errors raised while building, encoding, or decoding documents and messages.
///
/// All of these are local failures: the caller has to fix the input (or the
/// peer sent malformed bytes). Nothing here is retryable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("invalid modifier: {0}")]
    InvalidModifier(String),

    #[error("invalid namespace {namespace:?}: {reason}")]
    InvalidNamespace {
        namespace: String,
        reason: &'static str,
    },

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("unsupported type for key {key:?}: {found}")]
    UnsupportedType { key: String, found: &'static str },

    #[error("string contains an interior NUL byte and cannot be written as a cstring: {0:?}")]
    InvalidCString(String),

    #[error("missing NUL terminator for string at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("invalid UTF-8 at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("truncated input at offset {offset}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("document length mismatch: declared {declared}, available {available}")]
    LengthMismatch { declared: usize, available: usize },

    #[error("unknown element type {tag:#04x} at offset {offset}")]
    UnknownElementType { tag: u8, offset: usize },

    #[error("array element key {found:?} out of sequence (expected {expected:?})")]
    InvalidArrayKey { expected: String, found: String },

    #[error("invalid boolean byte {value:#04x} at offset {offset}")]
    InvalidBoolean { value: u8, offset: usize },

    #[error("document nesting exceeds {max} levels")]
    NestingTooDeep { max: usize },

    #[error("document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("invalid message length: {0}")]
    InvalidMessageLength(i32),

    #[error("unknown opcode: {0}")]
    UnknownOpCode(i32),

    #[error("expected opcode {expected}, found {found}")]
    UnexpectedOpCode { expected: i32, found: i32 },

    #[error("kill cursors message needs at least one cursor id")]
    EmptyKillCursors,

    #[error("insert message needs at least one document")]
    EmptyInsert,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a failure.
///
/// The client crate extends this to remote and transport failures; the
/// protocol crate itself only ever produces the first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad caller input: keys, modifiers, namespaces, identifiers.
    Validation,
    /// Bytes could not be produced or understood.
    Encoding,
    /// The server reported a failure.
    Protocol,
    /// Socket connect/read/write failure or timeout.
    Transport,
}

impl ProtocolError {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::InvalidKey { .. }
            | ProtocolError::InvalidModifier(_)
            | ProtocolError::InvalidNamespace { .. }
            | ProtocolError::InvalidObjectId(_)
            | ProtocolError::EmptyKillCursors
            | ProtocolError::EmptyInsert => ErrorKind::Validation,
            _ => ErrorKind::Encoding,
        }
    }

    pub(crate) fn truncated(offset: usize, needed: usize) -> Self {
        ProtocolError::Truncated { offset, needed }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "VALIDATION"),
            ErrorKind::Encoding => write!(f, "ENCODING"),
            ErrorKind::Protocol => write!(f, "PROTOCOL"),
            ErrorKind::Transport => write!(f, "TRANSPORT"),
        }
    }
}
