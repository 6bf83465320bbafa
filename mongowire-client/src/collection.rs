//! Collection-level API: writes, finds, indexes.

use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::database::{CollectionOptions, Database, IndexInfo, IndexSpec, ID_INDEX};
use crate::error::ClientError;
use mongowire_protocol::oid::global_generator;
use mongowire_protocol::{
    DeleteMessage, Document, InsertMessage, Namespace, ObjectIdGenerator, Query, Request,
    Selector, Update, UpdateMessage, Value,
};
use std::sync::Arc;

/// Primary key field.
pub const ID_FIELD: &str = "_id";

/// Handle to one collection.
///
/// Writes are fire-and-forget: the legacy protocol sends no acknowledgement
/// for insert, update or delete.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    namespace: Namespace,
    ids: Option<Arc<ObjectIdGenerator>>,
}

impl Collection {
    pub(crate) fn new(conn: Arc<Connection>, name: &str) -> Result<Self, ClientError> {
        let namespace = Namespace::new(conn.database(), name)?;
        Ok(Self {
            db: Database::from_connection(conn),
            namespace,
            ids: None,
        })
    }

    /// Generates `_id` values from `generator` instead of the process-wide one.
    pub fn with_id_generator(mut self, generator: Arc<ObjectIdGenerator>) -> Self {
        self.ids = Some(generator);
        self
    }

    pub fn name(&self) -> &str {
        &self.namespace.collection
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn send(&self, request: Request) -> Result<(), ClientError> {
        self.db.connection().send(&request).await
    }

    /// Puts an `_id` first in `doc` unless it already has one. Returns the id.
    ///
    /// `index` is the document's position in the insert, for error reports.
    fn ensure_id(
        &self,
        index: usize,
        mut doc: Document,
    ) -> Result<(Document, Value), ClientError> {
        doc.validate_keys()
            .map_err(|source| ClientError::InvalidDocument { index, source })?;
        if let Some(id) = doc.get(ID_FIELD) {
            let id = id.clone();
            return Ok((doc, id));
        }
        let generator = match &self.ids {
            Some(generator) => generator.as_ref(),
            None => global_generator(),
        };
        let id = Value::ObjectId(generator.generate());
        doc.put_first(ID_FIELD, id.clone())?;
        Ok((doc, id))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts one document, adding an `_id` when missing. Returns the `_id`.
    pub async fn insert(&self, doc: Document) -> Result<Value, ClientError> {
        let mut ids = self.insert_many(vec![doc]).await?;
        Ok(ids.pop().unwrap_or(Value::Null))
    }

    /// Inserts several documents in one message. Returns their `_id`s in order.
    pub async fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<Value>, ClientError> {
        let mut prepared = Vec::with_capacity(docs.len());
        let mut ids = Vec::with_capacity(docs.len());
        for (index, doc) in docs.into_iter().enumerate() {
            let (doc, id) = self.ensure_id(index, doc)?;
            prepared.push(doc);
            ids.push(id);
        }
        let message = InsertMessage::new(self.namespace.clone(), prepared);
        self.send(Request::Insert(message)).await?;
        Ok(ids)
    }

    /// Replaces or modifies the first document matching `selector`.
    ///
    /// With `upsert`, a document is created when nothing matches.
    pub async fn update(
        &self,
        selector: Selector,
        update: impl Into<Update>,
        upsert: bool,
    ) -> Result<(), ClientError> {
        let message = UpdateMessage::new(self.namespace.clone(), selector, update.into(), upsert);
        self.send(Request::Update(message)).await
    }

    /// Removes every document matching `selector`.
    pub async fn remove(&self, selector: Selector) -> Result<(), ClientError> {
        let message = DeleteMessage::new(self.namespace.clone(), selector);
        self.send(Request::Delete(message)).await
    }

    /// Removes every document.
    pub async fn clear(&self) -> Result<(), ClientError> {
        self.remove(Selector::new()).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Runs `query`; the caller must close the returned cursor.
    pub async fn find(&self, query: impl Into<Query>) -> Result<Cursor, ClientError> {
        self.db
            .connection()
            .query(self.name(), &query.into())
            .await
    }

    /// Returns the first document matching `selector`.
    pub async fn find_one(&self, selector: Selector) -> Result<Option<Document>, ClientError> {
        let mut cursor = self.find(Query::new(selector).limit(1)).await?;
        let first = cursor.next().await;
        let closed = cursor.close().await;
        let first = first?;
        closed?;
        Ok(first)
    }

    pub async fn count(&self, selector: Selector) -> Result<i64, ClientError> {
        self.db.count(self.name(), selector).await
    }

    /// Options the collection was created with, read from `system.namespaces`.
    pub async fn options(&self) -> Result<CollectionOptions, ClientError> {
        let info = self.db.collection_info(self.name()).await?;
        Ok(info
            .as_ref()
            .and_then(|doc| doc.get_document("options"))
            .map(CollectionOptions::from_document)
            .unwrap_or_default())
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    pub async fn create_index(&self, spec: &IndexSpec) -> Result<(), ClientError> {
        self.db.create_index(self.name(), spec).await
    }

    pub async fn drop_index(&self, name: &str) -> Result<(), ClientError> {
        self.db.drop_index(self.name(), name).await
    }

    /// Drops every index except the one on `_id`. Returns how many were dropped.
    pub async fn drop_indexes(&self) -> Result<usize, ClientError> {
        let indexes = self.index_information().await?;
        let mut dropped = 0;
        for index in indexes.iter().filter(|index| index.name != ID_INDEX) {
            self.drop_index(&index.name).await?;
            dropped += 1;
        }
        Ok(dropped)
    }

    pub async fn index_information(&self) -> Result<Vec<IndexInfo>, ClientError> {
        self.db.index_information(self.name()).await
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Action, MockServer};
    use mongowire_protocol::{Modifier, ProtocolError};

    async fn collection(server: &MockServer) -> Collection {
        Database::from_connection(server.connect().await)
            .collection("items")
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_injects_id_first() {
        let mut server = MockServer::start(|_| Action::Silent).await;
        let ids = Arc::new(ObjectIdGenerator::with_tags([1, 2, 3], [4, 5]));
        let coll = collection(&server).await.with_id_generator(ids);

        let doc = Document::new().with("a", 1).unwrap();
        let id = coll.insert(doc).await.unwrap();
        let oid = id.as_object_id().unwrap();

        match server.next_request().await.1 {
            Request::Insert(insert) => {
                assert_eq!(insert.namespace.full_name(), "test.items");
                let sent = &insert.documents[0];
                assert_eq!(sent.keys().collect::<Vec<_>>(), vec!["_id", "a"]);
                assert_eq!(sent.get_object_id("_id"), Some(oid));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_keeps_existing_id() {
        let mut server = MockServer::start(|_| Action::Silent).await;
        let coll = collection(&server).await;

        let docs = vec![
            Document::new().with("_id", 7).unwrap(),
            Document::new().with("b", true).unwrap(),
        ];
        let ids = coll.insert_many(docs).await.unwrap();
        assert_eq!(ids[0], Value::Int32(7));
        assert!(matches!(ids[1], Value::ObjectId(_)));

        match server.next_request().await.1 {
            Request::Insert(insert) => {
                assert_eq!(insert.documents.len(), 2);
                assert_eq!(insert.documents[0].get_i32("_id"), Some(7));
                assert_eq!(insert.documents[1].first_key(), Some("_id"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_keys_before_sending() {
        let mut server = MockServer::start(|_| Action::Silent).await;
        let coll = collection(&server).await;

        let operator = Selector::eq("$set", 1).unwrap().into_document();
        let docs = vec![Document::new().with("a", 1).unwrap(), operator];
        match coll.insert_many(docs).await {
            Err(ClientError::InvalidDocument { index, source }) => {
                assert_eq!(index, 1);
                assert!(matches!(
                    source,
                    ProtocolError::InvalidKey { ref key, .. } if key == "$set"
                ));
            }
            other => panic!("unexpected {:?}", other),
        }

        let with_id = Selector::eq("_id", 4)
            .unwrap()
            .with("x.y", 1)
            .unwrap()
            .into_document();
        let err = coll.insert(with_id).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidDocument { index: 0, .. }));
        assert!(err.to_string().contains("x.y"));

        assert!(coll.db.connection().is_connected());
        assert!(server.received().is_empty());
    }

    #[tokio::test]
    async fn test_insert_many_empty_is_rejected() {
        let server = MockServer::start(|_| Action::Silent).await;
        let coll = collection(&server).await;
        assert!(matches!(
            coll.insert_many(vec![]).await,
            Err(ClientError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let mut server = MockServer::start(|_| Action::Silent).await;
        let coll = collection(&server).await;

        let selector = Selector::eq("a", 1).unwrap();
        let modifier = Modifier::new().inc("hits", 1).unwrap();
        coll.update(selector.clone(), modifier.clone(), true)
            .await
            .unwrap();
        coll.remove(selector.clone()).await.unwrap();
        coll.clear().await.unwrap();

        match server.next_request().await.1 {
            Request::Update(update) => {
                assert!(update.upsert);
                assert_eq!(update.selector, selector);
                assert_eq!(update.update, Update::Modify(modifier));
            }
            other => panic!("unexpected {:?}", other),
        }
        match server.next_request().await.1 {
            Request::Delete(delete) => assert_eq!(delete.selector, selector),
            other => panic!("unexpected {:?}", other),
        }
        match server.next_request().await.1 {
            Request::Delete(delete) => assert!(delete.selector.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_find_one_closes_cursor() {
        let mut server = MockServer::start(|request| match request {
            Request::Query(_) => Action::documents(
                31,
                vec![
                    Document::new().with("n", 1).unwrap(),
                    Document::new().with("n", 2).unwrap(),
                ],
            ),
            _ => Action::Silent,
        })
        .await;
        let coll = collection(&server).await;

        let found = coll.find_one(Selector::eq("n", 1).unwrap()).await.unwrap();
        assert_eq!(found.unwrap().get_i32("n"), Some(1));

        match server.next_request().await.1 {
            Request::Query(query) => assert_eq!(query.number_to_return, 1),
            other => panic!("unexpected {:?}", other),
        }
        match server.next_request().await.1 {
            Request::KillCursors(kill) => assert_eq!(kill.cursor_ids, vec![31]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_find_one_none() {
        let server = MockServer::start(|_| Action::documents(0, vec![])).await;
        let coll = collection(&server).await;
        assert!(coll.find_one(Selector::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_options() {
        let server = MockServer::start(|_| {
            let options = Document::new()
                .with("capped", true)
                .unwrap()
                .with("size", 4096)
                .unwrap();
            Action::documents(
                0,
                vec![Document::new()
                    .with("name", "test.items")
                    .unwrap()
                    .with("options", options)
                    .unwrap()],
            )
        })
        .await;
        let coll = collection(&server).await;
        assert_eq!(coll.options().await.unwrap(), CollectionOptions::capped(4096));
    }

    #[tokio::test]
    async fn test_drop_indexes_skips_id_index() {
        let mut server = MockServer::start(|request| match request {
            Request::Query(query) if query.namespace.collection == "system.indexes" => {
                let entry = |name: &str, field: &str| {
                    Document::new()
                        .with("name", name)
                        .unwrap()
                        .with("ns", "test.items")
                        .unwrap()
                        .with("key", Document::new().with(field, 1).unwrap())
                        .unwrap()
                };
                Action::documents(0, vec![entry("_id_", "_id"), entry("a_1", "a")])
            }
            _ => Action::documents(0, vec![Document::new().with("ok", 1.0).unwrap()]),
        })
        .await;
        let coll = collection(&server).await;

        assert_eq!(coll.drop_indexes().await.unwrap(), 1);

        let _listing = server.next_request().await;
        match server.next_request().await.1 {
            Request::Query(query) => {
                assert_eq!(query.query.get_str("deleteIndexes"), Some("items"));
                assert_eq!(query.query.get_str("index"), Some("a_1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(server.received().is_empty());
    }

    #[tokio::test]
    async fn test_count_uses_collection_name() {
        let mut server = MockServer::start(|_| {
            Action::documents(
                0,
                vec![Document::new()
                    .with("ok", 1.0)
                    .unwrap()
                    .with("n", 3)
                    .unwrap()],
            )
        })
        .await;
        let coll = collection(&server).await;
        assert_eq!(coll.count(Selector::new()).await.unwrap(), 3);
        match server.next_request().await.1 {
            Request::Query(query) => assert_eq!(query.query.get_str("count"), Some("items")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
