//! # mongowire-protocol
//!
//! Binary document codec and wire-protocol messages for document databases
//! speaking the legacy opcode protocol.
//!
//! This crate provides:
//! - Ordered documents with selector and modifier variants
//! - The binary document codec (encode/decode, little-endian)
//! - Time-ordered 12-byte object ids
//! - Message framing for insert, update, delete, query, get-more,
//!   kill-cursors, msg and reply
//! - An incremental decoder for length-prefixed messages
//!
//! It performs no I/O; see `mongowire-client` for the TCP session.

pub mod bson;
pub mod codec;
pub mod document;
pub mod error;
pub mod json;
pub mod message;
pub mod oid;
pub mod query;
pub mod value;

pub use bson::{decode_document, encode_document, encode_document_into, hex_dump};
pub use codec::MessageDecoder;
pub use document::{Document, Modifier, Selector, Update, MODIFIER_OPERATORS, WHERE_KEY};
pub use error::{ErrorKind, ProtocolError};
pub use message::{
    next_request_id, DeleteMessage, GetMoreMessage, InsertMessage, KillCursorsMessage, Message,
    MessageBuilder, MessageHeader, MsgMessage, Namespace, OpCode, QueryMessage, ReplyMessage,
    Request, RequestIdGenerator, UpdateMessage, COMMAND_COLLECTION, HEADER_SIZE,
};
pub use oid::{ObjectId, ObjectIdGenerator};
pub use query::Query;
pub use value::{DbRef, ElementType, Regex, UtcDateTime, Value};

/// Default server port.
pub const DEFAULT_PORT: u16 = 27017;

/// Maximum encoded document size (4 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 4 * 1024 * 1024;

/// Maximum message size accepted from the wire (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum depth of nested documents and arrays.
pub const MAX_NESTING_DEPTH: usize = 100;
