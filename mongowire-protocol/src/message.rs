//! Wire messages: the 16-byte header and the opcode-specific bodies.
//!
//! ```text
//! +----------------+------------+-------------+---------+----------------+
//! | message_length | request_id | response_to | op_code | body           |
//! |    int32       |   int32    |    int32    |  int32  | length - 16    |
//! +----------------+------------+-------------+---------+----------------+
//! ```
//!
//! All integers are little-endian. Every request body except MSG and
//! KILL_CURSORS starts with a reserved int32 and the `db.collection`
//! namespace as a cstring.

use crate::bson::{self, write_cstring, Reader};
use crate::document::{check_cstring, Document, Modifier, Selector, Update};
use crate::error::ProtocolError;
use crate::MAX_MESSAGE_SIZE;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Collection name that routes a query to the command interpreter.
pub const COMMAND_COLLECTION: &str = "$cmd";

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Response to a query or get-more.
    Reply = 1,
    /// Free-form text message.
    Msg = 1000,
    Update = 2001,
    Insert = 2002,
    /// Reserved; never sent.
    GetByOid = 2003,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl TryFrom<i32> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            1000 => Ok(OpCode::Msg),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2003 => Ok(OpCode::GetByOid),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Msg => "OP_MSG",
            OpCode::Update => "OP_UPDATE",
            OpCode::Insert => "OP_INSERT",
            OpCode::GetByOid => "OP_GET_BY_OID",
            OpCode::Query => "OP_QUERY",
            OpCode::GetMore => "OP_GET_MORE",
            OpCode::Delete => "OP_DELETE",
            OpCode::KillCursors => "OP_KILL_CURSORS",
        };
        f.write_str(name)
    }
}

/// The fixed header at the front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length, header included.
    pub message_length: i32,
    pub request_id: i32,
    /// Request id this message answers; 0 for requests.
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code as i32);
    }

    /// Parses a header from the first 16 bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let message_length = reader.read_i32()?;
        check_message_length(message_length)?;
        let request_id = reader.read_i32()?;
        let response_to = reader.read_i32()?;
        let op_code = OpCode::try_from(reader.read_i32()?)?;
        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Number of body bytes following the header.
    pub fn body_len(&self) -> usize {
        (self.message_length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Rejects lengths shorter than a header or longer than [`MAX_MESSAGE_SIZE`].
pub fn check_message_length(length: i32) -> Result<usize, ProtocolError> {
    match usize::try_from(length) {
        Ok(len) if (HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&len) => Ok(len),
        _ => Err(ProtocolError::InvalidMessageLength(length)),
    }
}

/// Source of request ids, starting at 1.
///
/// Ids are always positive: after `i32::MAX` the sequence restarts at 1.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl RequestIdGenerator {
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// A non-positive `first` starts the sequence at 1.
    pub const fn starting_at(first: i32) -> Self {
        let first = if first > 0 { first } else { 1 };
        Self {
            next: AtomicI32::new(first),
        }
    }

    pub fn next_id(&self) -> i32 {
        let advance = |id: i32| Some(if id == i32::MAX { 1 } else { id + 1 });
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(id) | Err(id) => id,
        }
    }

    /// The id the next call to [`next_id`](Self::next_id) will return.
    pub fn peek(&self) -> i32 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REQUEST_IDS: RequestIdGenerator = RequestIdGenerator::new();

/// Draws the next id from the process-wide generator.
pub fn next_request_id() -> i32 {
    GLOBAL_REQUEST_IDS.next_id()
}

/// Validates a database name: non-empty, no `.`, no NUL.
pub fn validate_database_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidNamespace {
            namespace: name.to_string(),
            reason: "database name must not be empty",
        });
    }
    if name.contains('.') {
        return Err(ProtocolError::InvalidNamespace {
            namespace: name.to_string(),
            reason: "database name must not contain '.'",
        });
    }
    check_cstring(name)
}

/// A fully qualified collection name, rendered as `database.collection`.
///
/// The collection part may itself contain dots (`system.indexes`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let database = database.into();
        let collection = collection.into();
        validate_database_name(&database)?;
        if collection.is_empty() {
            return Err(ProtocolError::InvalidNamespace {
                namespace: format!("{}.", database),
                reason: "collection name must not be empty",
            });
        }
        check_cstring(&collection)?;
        Ok(Self {
            database,
            collection,
        })
    }

    /// The `<database>.$cmd` namespace that commands are queried against.
    pub fn command(database: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::new(database, COMMAND_COLLECTION)
    }

    /// Splits `db.collection` at the first dot.
    pub fn parse(full_name: &str) -> Result<Self, ProtocolError> {
        match full_name.split_once('.') {
            Some((database, collection)) => Self::new(database, collection),
            None => Err(ProtocolError::InvalidNamespace {
                namespace: full_name.to_string(),
                reason: "expected 'database.collection'",
            }),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Writes a message header followed by body fields.
///
/// The length field starts at [`HEADER_SIZE`] and is rewritten after every
/// appended field, so the buffer always holds a well-formed length.
pub struct MessageBuilder {
    buf: BytesMut,
}

impl MessageBuilder {
    pub fn new(op_code: OpCode, request_id: i32, response_to: i32) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        MessageHeader {
            message_length: HEADER_SIZE as i32,
            request_id,
            response_to,
            op_code,
        }
        .encode_into(&mut buf);
        Self { buf }
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self.update_length();
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self.update_length();
        self
    }

    pub fn put_cstring(&mut self, value: &str) -> Result<&mut Self, ProtocolError> {
        write_cstring(&mut self.buf, value)?;
        self.update_length();
        Ok(self)
    }

    pub fn put_document(&mut self, doc: &Document) -> Result<&mut Self, ProtocolError> {
        bson::encode_document_into(doc, &mut self.buf)?;
        self.update_length();
        Ok(self)
    }

    /// Current message length, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn update_length(&mut self) {
        let len = self.buf.len() as i32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
    }

    pub fn finish(self) -> Result<BytesMut, ProtocolError> {
        if self.buf.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::InvalidMessageLength(
                i32::try_from(self.buf.len()).unwrap_or(i32::MAX),
            ));
        }
        Ok(self.buf)
    }
}

/// OP_INSERT: one or more documents for a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub namespace: Namespace,
    pub documents: Vec<Document>,
}

impl InsertMessage {
    pub fn new(namespace: Namespace, documents: Vec<Document>) -> Self {
        Self {
            namespace,
            documents,
        }
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        if self.documents.is_empty() {
            return Err(ProtocolError::EmptyInsert);
        }
        let mut builder = MessageBuilder::new(OpCode::Insert, request_id, 0);
        builder
            .put_i32(0)
            .put_cstring(&self.namespace.full_name())?;
        for doc in &self.documents {
            builder.put_document(doc)?;
        }
        builder.finish()
    }
}

/// OP_UPDATE: replace or modify documents matching a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub namespace: Namespace,
    pub selector: Selector,
    pub update: Update,
    /// Insert the document when nothing matches.
    pub upsert: bool,
}

impl UpdateMessage {
    pub fn new(namespace: Namespace, selector: Selector, update: Update, upsert: bool) -> Self {
        Self {
            namespace,
            selector,
            update,
            upsert,
        }
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        let mut builder = MessageBuilder::new(OpCode::Update, request_id, 0);
        builder
            .put_i32(0)
            .put_cstring(&self.namespace.full_name())?
            .put_i32(i32::from(self.upsert))
            .put_document(self.selector.as_document())?
            .put_document(self.update.as_document())?;
        builder.finish()
    }
}

/// OP_DELETE: remove documents matching a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub namespace: Namespace,
    pub selector: Selector,
}

impl DeleteMessage {
    pub fn new(namespace: Namespace, selector: Selector) -> Self {
        Self {
            namespace,
            selector,
        }
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        let mut builder = MessageBuilder::new(OpCode::Delete, request_id, 0);
        builder
            .put_i32(0)
            .put_cstring(&self.namespace.full_name())?
            .put_i32(0)
            .put_document(self.selector.as_document())?;
        builder.finish()
    }
}

/// OP_QUERY: the first batch of a query or a command.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
    pub namespace: Namespace,
    pub number_to_skip: i32,
    /// Size of the first batch; 0 leaves it to the server.
    pub number_to_return: i32,
    /// Plain selector or a `{query, orderby, $hint}` wrapper.
    pub query: Document,
    pub projection: Option<Document>,
}

impl QueryMessage {
    pub fn new(namespace: Namespace, query: Document) -> Self {
        Self {
            namespace,
            number_to_skip: 0,
            number_to_return: 0,
            query,
            projection: None,
        }
    }

    pub fn with_skip(mut self, skip: i32) -> Self {
        self.number_to_skip = skip;
        self
    }

    pub fn with_number_to_return(mut self, n: i32) -> Self {
        self.number_to_return = n;
        self
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        let mut builder = MessageBuilder::new(OpCode::Query, request_id, 0);
        builder
            .put_i32(0)
            .put_cstring(&self.namespace.full_name())?
            .put_i32(self.number_to_skip)
            .put_i32(self.number_to_return)
            .put_document(&self.query)?;
        if let Some(projection) = &self.projection {
            builder.put_document(projection)?;
        }
        builder.finish()
    }
}

/// OP_GET_MORE: the next batch of an open server cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMoreMessage {
    pub namespace: Namespace,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl GetMoreMessage {
    pub fn new(namespace: Namespace, cursor_id: i64) -> Self {
        Self {
            namespace,
            number_to_return: 0,
            cursor_id,
        }
    }

    pub fn with_number_to_return(mut self, n: i32) -> Self {
        self.number_to_return = n;
        self
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        let mut builder = MessageBuilder::new(OpCode::GetMore, request_id, 0);
        builder
            .put_i32(0)
            .put_cstring(&self.namespace.full_name())?
            .put_i32(self.number_to_return)
            .put_i64(self.cursor_id);
        builder.finish()
    }
}

/// OP_KILL_CURSORS: release server cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillCursorsMessage {
    pub cursor_ids: Vec<i64>,
}

impl KillCursorsMessage {
    pub fn new(cursor_ids: Vec<i64>) -> Self {
        Self { cursor_ids }
    }

    pub fn single(cursor_id: i64) -> Self {
        Self::new(vec![cursor_id])
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        if self.cursor_ids.is_empty() {
            return Err(ProtocolError::EmptyKillCursors);
        }
        let mut builder = MessageBuilder::new(OpCode::KillCursors, request_id, 0);
        builder.put_i32(0).put_i32(self.cursor_ids.len() as i32);
        for id in &self.cursor_ids {
            builder.put_i64(*id);
        }
        builder.finish()
    }
}

/// OP_MSG: free-form text for the server log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgMessage {
    pub text: String,
}

impl MsgMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        let mut builder = MessageBuilder::new(OpCode::Msg, request_id, 0);
        builder.put_cstring(&self.text)?;
        builder.finish()
    }
}

/// Any client-to-server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Query(QueryMessage),
    GetMore(GetMoreMessage),
    KillCursors(KillCursorsMessage),
    Msg(MsgMessage),
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Insert(_) => OpCode::Insert,
            Request::Update(_) => OpCode::Update,
            Request::Delete(_) => OpCode::Delete,
            Request::Query(_) => OpCode::Query,
            Request::GetMore(_) => OpCode::GetMore,
            Request::KillCursors(_) => OpCode::KillCursors,
            Request::Msg(_) => OpCode::Msg,
        }
    }

    /// Whether the server answers this request with a reply.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Query(_) | Request::GetMore(_))
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut, ProtocolError> {
        match self {
            Request::Insert(m) => m.encode(request_id),
            Request::Update(m) => m.encode(request_id),
            Request::Delete(m) => m.encode(request_id),
            Request::Query(m) => m.encode(request_id),
            Request::GetMore(m) => m.encode(request_id),
            Request::KillCursors(m) => m.encode(request_id),
            Request::Msg(m) => m.encode(request_id),
        }
    }

    fn decode_body(op_code: OpCode, body: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let request = match op_code {
            OpCode::Insert => {
                body.read_i32()?;
                let namespace = Namespace::parse(body.read_cstring()?)?;
                let mut documents = Vec::new();
                while body.remaining() > 0 {
                    documents.push(body.read_document()?);
                }
                Request::Insert(InsertMessage::new(namespace, documents))
            }
            OpCode::Update => {
                body.read_i32()?;
                let namespace = Namespace::parse(body.read_cstring()?)?;
                let upsert = body.read_i32()? & 1 == 1;
                let selector = Selector::from(body.read_document()?);
                let update = decode_update(body.read_document()?)?;
                Request::Update(UpdateMessage::new(namespace, selector, update, upsert))
            }
            OpCode::Delete => {
                body.read_i32()?;
                let namespace = Namespace::parse(body.read_cstring()?)?;
                body.read_i32()?;
                let selector = Selector::from(body.read_document()?);
                Request::Delete(DeleteMessage::new(namespace, selector))
            }
            OpCode::Query => {
                body.read_i32()?;
                let namespace = Namespace::parse(body.read_cstring()?)?;
                let number_to_skip = body.read_i32()?;
                let number_to_return = body.read_i32()?;
                let query = body.read_document()?;
                let projection = if body.remaining() > 0 {
                    Some(body.read_document()?)
                } else {
                    None
                };
                Request::Query(QueryMessage {
                    namespace,
                    number_to_skip,
                    number_to_return,
                    query,
                    projection,
                })
            }
            OpCode::GetMore => {
                body.read_i32()?;
                let namespace = Namespace::parse(body.read_cstring()?)?;
                let number_to_return = body.read_i32()?;
                let cursor_id = body.read_i64()?;
                Request::GetMore(GetMoreMessage {
                    namespace,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                body.read_i32()?;
                let count = body.read_i32()?;
                let count = usize::try_from(count)
                    .map_err(|_| ProtocolError::InvalidMessageLength(count))?;
                let mut cursor_ids = Vec::with_capacity(count.min(body.remaining() / 8));
                for _ in 0..count {
                    cursor_ids.push(body.read_i64()?);
                }
                Request::KillCursors(KillCursorsMessage::new(cursor_ids))
            }
            OpCode::Msg => Request::Msg(MsgMessage::new(body.read_cstring()?)),
            OpCode::Reply | OpCode::GetByOid => {
                return Err(ProtocolError::UnknownOpCode(op_code as i32))
            }
        };
        Ok(request)
    }
}

/// Operator documents decode as modifiers, anything else as a replacement.
fn decode_update(doc: Document) -> Result<Update, ProtocolError> {
    let is_modifier = !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'));
    if is_modifier {
        Ok(Update::Modify(Modifier::try_from(doc)?))
    } else {
        Ok(Update::Replace(doc))
    }
}

/// OP_REPLY: one batch of results.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    pub header: MessageHeader,
    /// Non-zero means the query failed and `documents` holds one error document.
    pub flags: i32,
    /// Server cursor handle; 0 when no more batches remain.
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl ReplyMessage {
    /// Builds a successful reply; the header is filled in by [`encode`](Self::encode).
    pub fn new(cursor_id: i64, starting_from: i32, documents: Vec<Document>) -> Self {
        Self {
            header: MessageHeader {
                message_length: 0,
                request_id: 0,
                response_to: 0,
                op_code: OpCode::Reply,
            },
            flags: 0,
            cursor_id,
            starting_from,
            number_returned: documents.len() as i32,
            documents,
        }
    }

    /// Builds a failed reply carrying a single error document.
    pub fn failure(flags: i32, error: Document) -> Self {
        let mut reply = Self::new(0, 0, vec![error]);
        reply.flags = flags;
        reply
    }

    pub fn is_query_failure(&self) -> bool {
        self.flags != 0
    }

    /// The error document of a failed reply.
    pub fn error_document(&self) -> Option<&Document> {
        if self.is_query_failure() {
            self.documents.first()
        } else {
            None
        }
    }

    pub fn encode(&self, request_id: i32, response_to: i32) -> Result<BytesMut, ProtocolError> {
        let mut builder = MessageBuilder::new(OpCode::Reply, request_id, response_to);
        builder
            .put_i32(self.flags)
            .put_i64(self.cursor_id)
            .put_i32(self.starting_from)
            .put_i32(self.documents.len() as i32);
        for doc in &self.documents {
            builder.put_document(doc)?;
        }
        builder.finish()
    }

    /// Parses a complete reply message, header included.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, mut body) = split_message(bytes)?;
        if header.op_code != OpCode::Reply {
            return Err(ProtocolError::UnexpectedOpCode {
                expected: OpCode::Reply as i32,
                found: header.op_code as i32,
            });
        }
        Self::decode_body(header, &mut body)
    }

    fn decode_body(header: MessageHeader, body: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let flags = body.read_i32()?;
        let cursor_id = body.read_i64()?;
        let starting_from = body.read_i32()?;
        let number_returned = body.read_i32()?;
        let count = usize::try_from(number_returned)
            .map_err(|_| ProtocolError::InvalidMessageLength(header.message_length))?;
        let mut documents = Vec::with_capacity(count.min(body.remaining() / 5));
        for _ in 0..count {
            documents.push(body.read_document()?);
        }
        Ok(Self {
            header,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }
}

/// Validates the header and returns a reader over exactly the body bytes.
fn split_message(bytes: &[u8]) -> Result<(MessageHeader, Reader<'_>), ProtocolError> {
    let header = MessageHeader::decode(bytes)?;
    let len = header.message_length as usize;
    if bytes.len() < len {
        return Err(ProtocolError::truncated(bytes.len(), len - bytes.len()));
    }
    Ok((header, Reader::with_base(&bytes[HEADER_SIZE..len], HEADER_SIZE)))
}

/// Any decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        header: MessageHeader,
        request: Request,
    },
    Reply(ReplyMessage),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Request { header, .. } => header,
            Message::Reply(reply) => &reply.header,
        }
    }

    /// Parses a complete message of any opcode except the reserved OP_GET_BY_OID.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, mut body) = split_message(bytes)?;
        match header.op_code {
            OpCode::Reply => Ok(Message::Reply(ReplyMessage::decode_body(header, &mut body)?)),
            op_code => Ok(Message::Request {
                header,
                request: Request::decode_body(op_code, &mut body)?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn ns(db: &str, coll: &str) -> Namespace {
        Namespace::new(db, coll).unwrap()
    }

    fn le_i32(bytes: &[u8], at: usize) -> i32 {
        i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(OpCode::Reply as i32, 1);
        assert_eq!(OpCode::Msg as i32, 1000);
        assert_eq!(OpCode::Query as i32, 2004);
        assert_eq!(OpCode::KillCursors as i32, 2007);
        assert_eq!(OpCode::try_from(2005).unwrap(), OpCode::GetMore);
        assert!(matches!(
            OpCode::try_from(2008),
            Err(ProtocolError::UnknownOpCode(2008))
        ));
        assert_eq!(OpCode::Delete.to_string(), "OP_DELETE");
    }

    #[test]
    fn test_query_message_layout() {
        let query = Document::new().with("a", 2).unwrap();
        let msg = QueryMessage::new(ns("d", "c"), query.clone())
            .with_skip(5)
            .with_number_to_return(10);
        let bytes = msg.encode(7).unwrap();

        assert_eq!(le_i32(&bytes, 0) as usize, bytes.len());
        assert_eq!(le_i32(&bytes, 4), 7);
        assert_eq!(le_i32(&bytes, 8), 0);
        assert_eq!(le_i32(&bytes, 12), 2004);
        assert_eq!(le_i32(&bytes, 16), 0);
        assert_eq!(&bytes[20..24], b"d.c\0");
        assert_eq!(le_i32(&bytes, 24), 5);
        assert_eq!(le_i32(&bytes, 28), 10);
        assert_eq!(&bytes[32..], &bson::encode_document(&query).unwrap()[..]);
    }

    #[test]
    fn test_query_with_projection_appends_document() {
        let fields = Document::new().with("name", 1).unwrap();
        let msg = QueryMessage::new(ns("d", "c"), Document::new()).with_projection(fields.clone());
        let bytes = msg.encode(1).unwrap();
        let projection = bson::encode_document(&fields).unwrap();
        assert!(bytes.ends_with(&projection));
        assert_eq!(bytes.len(), 16 + 4 + 4 + 8 + 5 + projection.len());
    }

    #[test]
    fn test_get_more_layout() {
        let bytes = GetMoreMessage::new(ns("db", "things"), 0x0102_0304_0506_0708)
            .encode(3)
            .unwrap();
        assert_eq!(le_i32(&bytes, 12), 2005);
        assert_eq!(&bytes[20..30], b"db.things\0");
        assert_eq!(le_i32(&bytes, 30), 0);
        assert_eq!(
            i64::from_le_bytes(bytes[34..42].try_into().unwrap()),
            0x0102_0304_0506_0708
        );
        assert_eq!(bytes.len(), 42);
    }

    #[test]
    fn test_kill_cursors_layout() {
        let bytes = KillCursorsMessage::new(vec![11, 22]).encode(9).unwrap();
        assert_eq!(bytes.len(), 16 + 4 + 4 + 16);
        assert_eq!(le_i32(&bytes, 12), 2007);
        assert_eq!(le_i32(&bytes, 16), 0);
        assert_eq!(le_i32(&bytes, 20), 2);
        assert_eq!(i64::from_le_bytes(bytes[24..32].try_into().unwrap()), 11);
        assert_eq!(i64::from_le_bytes(bytes[32..40].try_into().unwrap()), 22);

        assert!(matches!(
            KillCursorsMessage::new(vec![]).encode(1),
            Err(ProtocolError::EmptyKillCursors)
        ));
    }

    #[test]
    fn test_delete_has_second_reserved_field() {
        let bytes = DeleteMessage::new(ns("d", "c"), Selector::new())
            .encode(1)
            .unwrap();
        assert_eq!(le_i32(&bytes, 12), 2006);
        assert_eq!(le_i32(&bytes, 24), 0);
        assert_eq!(&bytes[28..], &[5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_update_upsert_flag() {
        let update = Modifier::new().set("a", 1).unwrap();
        let bytes = UpdateMessage::new(ns("d", "c"), Selector::new(), update.into(), true)
            .encode(1)
            .unwrap();
        assert_eq!(le_i32(&bytes, 12), 2001);
        assert_eq!(le_i32(&bytes, 24), 1);
    }

    #[test]
    fn test_insert_requires_documents() {
        assert!(matches!(
            InsertMessage::new(ns("d", "c"), vec![]).encode(1),
            Err(ProtocolError::EmptyInsert)
        ));
    }

    #[test]
    fn test_msg_message() {
        let bytes = MsgMessage::new("hello").encode(4).unwrap();
        assert_eq!(bytes.len(), 16 + 6);
        assert_eq!(le_i32(&bytes, 12), 1000);
        assert_eq!(&bytes[16..], b"hello\0");
    }

    #[test]
    fn test_builder_patches_length_as_it_grows() {
        let mut builder = MessageBuilder::new(OpCode::Query, 1, 0);
        assert_eq!(builder.len(), HEADER_SIZE);
        builder.put_i32(0);
        assert_eq!(builder.len(), 20);
        builder.put_cstring("a.b").unwrap();
        let bytes = builder.finish().unwrap();
        assert_eq!(le_i32(&bytes, 0), 24);
    }

    #[test]
    fn test_request_decode_round_trip() {
        let namespace = ns("shop", "orders");
        let requests = vec![
            Request::Insert(InsertMessage::new(
                namespace.clone(),
                vec![
                    Document::new().with("a", 1).unwrap(),
                    Document::new().with("b", "x").unwrap(),
                ],
            )),
            Request::Update(UpdateMessage::new(
                namespace.clone(),
                Selector::eq("a", 1).unwrap(),
                Modifier::new().inc("n", 1).unwrap().into(),
                false,
            )),
            Request::Update(UpdateMessage::new(
                namespace.clone(),
                Selector::new(),
                Document::new().with("z", Value::Null).unwrap().into(),
                true,
            )),
            Request::Delete(DeleteMessage::new(
                namespace.clone(),
                Selector::eq("a", 1).unwrap(),
            )),
            Request::Query(
                QueryMessage::new(namespace.clone(), Document::new())
                    .with_skip(1)
                    .with_number_to_return(2)
                    .with_projection(Document::new().with("a", 1).unwrap()),
            ),
            Request::GetMore(GetMoreMessage::new(namespace.clone(), 99).with_number_to_return(5)),
            Request::KillCursors(KillCursorsMessage::new(vec![1, 2, 3])),
            Request::Msg(MsgMessage::new("note")),
        ];

        for (i, request) in requests.into_iter().enumerate() {
            let id = i as i32 + 100;
            let bytes = request.encode(id).unwrap();
            match Message::decode(&bytes).unwrap() {
                Message::Request {
                    header,
                    request: decoded,
                } => {
                    assert_eq!(header.request_id, id);
                    assert_eq!(header.op_code, request.op_code());
                    assert_eq!(header.message_length as usize, bytes.len());
                    assert_eq!(decoded, request);
                }
                other => panic!("expected request, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_reply_decode() {
        let docs = vec![
            Document::new().with("a", 1).unwrap(),
            Document::new().with("a", 2).unwrap(),
        ];
        let bytes = ReplyMessage::new(77, 0, docs.clone()).encode(5, 42).unwrap();
        let reply = ReplyMessage::decode(&bytes).unwrap();

        assert_eq!(reply.header.response_to, 42);
        assert_eq!(reply.header.request_id, 5);
        assert_eq!(reply.header.op_code, OpCode::Reply);
        assert_eq!(reply.cursor_id, 77);
        assert_eq!(reply.number_returned, 2);
        assert_eq!(reply.documents, docs);
        assert!(!reply.is_query_failure());
        assert!(reply.error_document().is_none());
    }

    #[test]
    fn test_reply_failure_carries_error_document() {
        let mut err = Document::new();
        err.insert_unchecked("$err".into(), Value::from("bad query"));
        let bytes = ReplyMessage::failure(2, err.clone()).encode(1, 1).unwrap();

        let reply = ReplyMessage::decode(&bytes).unwrap();
        assert!(reply.is_query_failure());
        assert_eq!(reply.error_document(), Some(&err));
    }

    #[test]
    fn test_reply_decode_rejects_other_opcodes() {
        let bytes = MsgMessage::new("x").encode(1).unwrap();
        assert!(matches!(
            ReplyMessage::decode(&bytes),
            Err(ProtocolError::UnexpectedOpCode {
                expected: 1,
                found: 1000
            })
        ));
    }

    #[test]
    fn test_reply_decode_truncated_documents() {
        let bytes = ReplyMessage::new(0, 0, vec![Document::new().with("a", 1).unwrap()])
            .encode(1, 1)
            .unwrap();
        // Claim two documents while carrying one.
        let mut patched = bytes.to_vec();
        patched[32..36].copy_from_slice(&2i32.to_le_bytes());
        assert!(matches!(
            ReplyMessage::decode(&patched),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_header_length_bounds() {
        let mut bytes = BytesMut::new();
        MessageHeader {
            message_length: 15,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Reply,
        }
        .encode_into(&mut bytes);
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(ProtocolError::InvalidMessageLength(15))
        ));

        assert!(check_message_length(MAX_MESSAGE_SIZE as i32 + 1).is_err());
        assert!(check_message_length(-1).is_err());
        assert_eq!(check_message_length(16).unwrap(), 16);
    }

    #[test]
    fn test_message_shorter_than_declared() {
        let bytes = MsgMessage::new("hello").encode(1).unwrap();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 2]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_get_by_oid_not_decodable() {
        let builder = MessageBuilder::new(OpCode::GetByOid, 1, 0);
        let bytes = builder.finish().unwrap();
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::UnknownOpCode(2003))
        ));
    }

    #[test]
    fn test_request_id_generator() {
        let ids = RequestIdGenerator::new();
        assert_eq!(ids.peek(), 1);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.peek(), 3);

        let ids = RequestIdGenerator::starting_at(500);
        assert_eq!(ids.next_id(), 500);

        let a = next_request_id();
        let b = next_request_id();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn test_request_ids_stay_positive() {
        let ids = RequestIdGenerator::starting_at(i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX);
        assert_eq!(ids.peek(), 1);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);

        assert_eq!(RequestIdGenerator::starting_at(0).next_id(), 1);
        assert_eq!(RequestIdGenerator::starting_at(-7).next_id(), 1);
    }

    #[test]
    fn test_namespace_validation() {
        assert_eq!(ns("db", "coll").to_string(), "db.coll");
        assert_eq!(ns("db", "system.indexes").full_name(), "db.system.indexes");
        assert_eq!(Namespace::command("db").unwrap().to_string(), "db.$cmd");

        assert!(Namespace::new("", "c").is_err());
        assert!(Namespace::new("a.b", "c").is_err());
        assert!(Namespace::new("a", "").is_err());

        let parsed = Namespace::parse("db.system.namespaces").unwrap();
        assert_eq!(parsed.database, "db");
        assert_eq!(parsed.collection, "system.namespaces");
        assert!(Namespace::parse("nodot").is_err());
    }
}
