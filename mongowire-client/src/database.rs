//! Database-level API: commands and system collections.

use crate::collection::Collection;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use mongowire_protocol::{
    Document, InsertMessage, MsgMessage, Namespace, ProtocolError, Query, Request, Selector,
    Value,
};
use std::sync::Arc;

/// Collection listing every collection in the database.
pub const SYSTEM_NAMESPACES: &str = "system.namespaces";

/// Collection holding one document per index.
pub const SYSTEM_INDEXES: &str = "system.indexes";

/// Name of the index every collection has on `_id`.
pub const ID_INDEX: &str = "_id_";

/// Server-side profiling level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProfilingLevel {
    Off = 0,
    SlowOnly = 1,
    All = 2,
}

impl TryFrom<i32> for ProfilingLevel {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProfilingLevel::Off),
            1 => Ok(ProfilingLevel::SlowOnly),
            2 => Ok(ProfilingLevel::All),
            other => Err(other),
        }
    }
}

/// Options for creating a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionOptions {
    pub capped: bool,
    /// Initial extent in bytes; the size limit when capped.
    pub size: Option<i64>,
    /// Maximum number of documents in a capped collection.
    pub max: Option<i64>,
}

impl CollectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capped collection limited to `size` bytes.
    pub fn capped(size: i64) -> Self {
        Self {
            capped: true,
            size: Some(size),
            max: None,
        }
    }

    pub fn with_max(mut self, max: i64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    /// Appends the option fields to a `create` command.
    fn apply(&self, mut command: Selector) -> Result<Selector, ProtocolError> {
        if self.capped {
            command.put("capped", true)?;
        }
        if let Some(size) = self.size {
            command.put("size", size)?;
        }
        if let (true, Some(max)) = (self.capped, self.max) {
            command.put("max", max)?;
        }
        Ok(command)
    }

    /// Reads the `options` sub-document of a `system.namespaces` entry.
    pub fn from_document(options: &Document) -> Self {
        let positive = |key: &str| options.get_i64(key).filter(|v| *v > 0);
        let capped = options.get_bool("capped").unwrap_or(false);
        Self {
            capped,
            size: positive("size"),
            max: if capped { positive("max") } else { None },
        }
    }
}

/// An index to create: a name and the fields it covers, all ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexSpec {
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// The `{field: 1, ...}` key document.
    pub fn key(&self) -> Result<Selector, ProtocolError> {
        let mut key = Selector::new();
        for field in &self.fields {
            key.put(field.as_str(), 1)?;
        }
        Ok(key)
    }
}

/// An index as reported by `system.indexes`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    /// Collection name without the database prefix.
    pub collection: String,
    /// The key document, e.g. `{a: 1, b: -1}`.
    pub key: Document,
    pub unique: bool,
}

impl IndexInfo {
    /// Field names covered by the index, in key order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.key.keys()
    }

    fn from_document(doc: Document) -> Result<Self, ClientError> {
        let malformed = |reason, document| ClientError::MalformedReply { reason, document };
        let Some(name) = doc.get_str("name").map(str::to_string) else {
            return Err(malformed("index entry has no name", doc));
        };
        let Some(key) = doc.get_document("key").cloned() else {
            return Err(malformed("index entry has no key", doc));
        };
        let Some(collection) = doc
            .get_str("ns")
            .and_then(|ns| ns.split_once('.'))
            .map(|(_, collection)| collection.to_string())
        else {
            return Err(malformed("index entry has no namespace", doc));
        };
        let unique = doc.get_bool("unique").unwrap_or(false);
        Ok(Self {
            name,
            collection,
            key,
            unique,
        })
    }
}

/// Handle to one database on a connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Connection>,
}

impl Database {
    /// Creates a database handle with its own (not yet connected) connection.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn name(&self) -> &str {
        self.conn.database()
    }

    /// Returns a handle to a collection. No server round trip.
    pub fn collection(&self, name: &str) -> Result<Collection, ClientError> {
        Collection::new(self.conn.clone(), name)
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    /// Runs a query to completion and closes its cursor.
    async fn query_all(
        &self,
        collection: &str,
        selector: Selector,
    ) -> Result<Vec<Document>, ClientError> {
        let mut cursor = self.conn.query(collection, &Query::new(selector)).await?;
        let docs = cursor.collect_all().await;
        let closed = cursor.close().await;
        let docs = docs?;
        closed?;
        Ok(docs)
    }

    fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.name(), collection)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Runs an arbitrary command; fails unless the result has `ok: 1`.
    pub async fn run_command(&self, command: Selector) -> Result<Document, ClientError> {
        self.conn.command(command).await
    }

    /// Counts documents in `collection` matching `query`.
    pub async fn count(&self, collection: &str, query: Selector) -> Result<i64, ClientError> {
        let command = Selector::new()
            .with("count", collection)?
            .with("query", query)?;
        let result = self.run_command(command).await?;
        match result.get("n").and_then(Value::as_i64) {
            Some(n) => Ok(n),
            None => Err(ClientError::MalformedReply {
                reason: "count result has no n",
                document: result,
            }),
        }
    }

    /// Creates a collection with the given options.
    pub async fn create_collection(
        &self,
        name: &str,
        options: &CollectionOptions,
    ) -> Result<Collection, ClientError> {
        let collection = self.collection(name)?;
        let command = options.apply(Selector::eq("create", name)?)?;
        self.run_command(command).await?;
        tracing::debug!("Created collection {}", collection.namespace());
        Ok(collection)
    }

    /// Drops a collection and its indexes.
    pub async fn drop_collection(&self, name: &str) -> Result<(), ClientError> {
        self.run_command(Selector::eq("drop", name)?).await?;
        tracing::debug!("Dropped collection {}.{}", self.name(), name);
        Ok(())
    }

    /// Drops one index of a collection by name.
    pub async fn drop_index(&self, collection: &str, index: &str) -> Result<(), ClientError> {
        let command = Selector::new()
            .with("deleteIndexes", collection)?
            .with("index", index)?;
        self.run_command(command).await?;
        Ok(())
    }

    /// Reads the current profiling level.
    pub async fn profiling_level(&self) -> Result<ProfilingLevel, ClientError> {
        self.profile(-1).await
    }

    /// Sets the profiling level and returns the previous one.
    pub async fn set_profiling_level(
        &self,
        level: ProfilingLevel,
    ) -> Result<ProfilingLevel, ClientError> {
        self.profile(level as i32).await
    }

    async fn profile(&self, level: i32) -> Result<ProfilingLevel, ClientError> {
        let result = self.run_command(Selector::eq("profile", level)?).await?;
        let was = result
            .get("was")
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .and_then(|v| ProfilingLevel::try_from(v).ok());
        match was {
            Some(level) => Ok(level),
            None => Err(ClientError::MalformedReply {
                reason: "profile result has no valid was",
                document: result,
            }),
        }
    }

    /// Evaluates JavaScript on the server and returns its `retval`.
    pub async fn eval(&self, code: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let command = Selector::new()
            .with("$eval", Value::Code(code.to_string()))?
            .with("args", Value::Array(args))?;
        let mut result = self.run_command(command).await?;
        Ok(result.remove("retval").unwrap_or(Value::Null))
    }

    /// Sends a free-form diagnostic message. Nothing is read back.
    pub async fn send_msg(&self, text: &str) -> Result<(), ClientError> {
        self.conn.send(&Request::Msg(MsgMessage::new(text))).await
    }

    // =========================================================================
    // System collections
    // =========================================================================

    /// Names of all collections, without the database prefix.
    pub async fn collection_names(&self) -> Result<Vec<String>, ClientError> {
        let prefix = format!("{}.", self.name());
        let entries = self.query_all(SYSTEM_NAMESPACES, Selector::new()).await?;
        Ok(entries
            .iter()
            .filter_map(|doc| doc.get_str("name"))
            .filter(|name| !name.is_empty())
            .map(|name| name.strip_prefix(&prefix).unwrap_or(name).to_string())
            .collect())
    }

    /// The `system.namespaces` entry for one collection, if it exists.
    pub async fn collection_info(&self, name: &str) -> Result<Option<Document>, ClientError> {
        let selector = Selector::eq("name", self.namespace(name))?;
        let mut cursor = self
            .conn
            .query(SYSTEM_NAMESPACES, &Query::new(selector).limit(1))
            .await?;
        let first = cursor.next().await;
        let closed = cursor.close().await;
        let first = first?;
        closed?;
        Ok(first)
    }

    /// Indexes defined on `collection`.
    pub async fn index_information(
        &self,
        collection: &str,
    ) -> Result<Vec<IndexInfo>, ClientError> {
        let selector = Selector::eq("ns", self.namespace(collection))?;
        self.query_all(SYSTEM_INDEXES, selector)
            .await?
            .into_iter()
            .map(IndexInfo::from_document)
            .collect()
    }

    /// Creates an index by inserting its description into `system.indexes`.
    pub async fn create_index(
        &self,
        collection: &str,
        spec: &IndexSpec,
    ) -> Result<(), ClientError> {
        let entry = Document::new()
            .with("name", spec.name.as_str())?
            .with("ns", self.namespace(collection))?
            .with("key", spec.key()?)?;
        let namespace = Namespace::new(self.name(), SYSTEM_INDEXES)?;
        self.conn
            .send(&Request::Insert(InsertMessage::new(namespace, vec![entry])))
            .await?;
        tracing::debug!(
            "Created index {} on {}",
            spec.name,
            self.namespace(collection)
        );
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("addr", &self.conn.config().addr)
            .finish()
    }
}
