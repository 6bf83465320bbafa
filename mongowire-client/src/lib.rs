//! # mongowire-client
//!
//! Async client for document databases speaking the legacy opcode protocol.
//!
//! This crate provides:
//! - A TCP session that serializes each write-then-read exchange
//! - Cursors that fetch further batches on demand and kill server cursors on close
//! - Database commands (count, create/drop collection, indexes, profiling, eval)
//! - Collection helpers for insert, update, remove and find
//!
//! There is no reconnect or retry; [`ClientError::is_retryable`] tells the
//! caller which failures are worth retrying.

pub mod collection;
pub mod connection;
pub mod cursor;
pub mod database;
pub mod error;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use collection::Collection;
pub use connection::{Connection, ConnectionConfig};
pub use cursor::{Cursor, CursorState};
pub use database::{CollectionOptions, Database, IndexInfo, IndexSpec, ProfilingLevel};
pub use error::ClientError;
pub use mongowire_protocol::ErrorKind;
pub use stream::{ClientStream, Transport};
