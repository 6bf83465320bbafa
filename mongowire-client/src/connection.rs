//! Connection management.

use crate::cursor::Cursor;
use crate::error::ClientError;
use crate::stream::{ClientStream, Transport};
use mongowire_protocol::message::{next_request_id, validate_database_name};
use mongowire_protocol::{
    Document, MessageDecoder, MessageHeader, Namespace, OpCode, Query, QueryMessage, ReplyMessage,
    Request, RequestIdGenerator, Selector, Value, DEFAULT_PORT,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Database used when none is configured.
pub const DEFAULT_DATABASE: &str = "test";

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// Database every request on this connection is addressed to.
    pub database: String,
    /// Connection timeout.
    #[serde(with = "duration_ms_serde", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Upper bound on one write-then-read exchange.
    #[serde(with = "duration_ms_serde", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Reject replies whose `responseTo` does not echo the request id.
    pub verify_response_to: bool,
    pub tcp_nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(
            SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            DEFAULT_DATABASE,
        )
    }
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr, database: impl Into<String>) -> Self {
        Self {
            addr,
            database: database.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            verify_response_to: true,
            tcp_nodelay: true,
        }
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env(database: impl Into<String>) -> Self {
        let mut config = Self {
            database: database.into(),
            ..Self::default()
        };
        config.apply_env_overrides();
        config
    }

    /// Applies `MONGOWIRE_*` environment variables. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MONGOWIRE_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.addr = parsed;
            }
        }

        if let Ok(database) = std::env::var("MONGOWIRE_DATABASE") {
            if validate_database_name(&database).is_ok() {
                self.database = database;
            }
        }

        if let Ok(ms) = std::env::var("MONGOWIRE_CONNECT_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse() {
                self.connect_timeout = Duration::from_millis(parsed);
            }
        }

        if let Ok(ms) = std::env::var("MONGOWIRE_REQUEST_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse() {
                self.request_timeout = Duration::from_millis(parsed);
            }
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_verify_response_to(mut self, verify: bool) -> Self {
        self.verify_response_to = verify;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }
}

/// The socket plus its framing state. Only touched under the connection lock.
struct Session {
    stream: ClientStream,
    decoder: MessageDecoder,
    read_buf: Vec<u8>,
}

impl Session {
    fn new(stream: ClientStream, read_buffer_size: usize) -> Self {
        let size = read_buffer_size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        Self {
            stream,
            decoder: MessageDecoder::with_capacity(size),
            read_buf: vec![0u8; size],
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads until one whole reply is buffered.
    async fn read_reply(&mut self) -> Result<ReplyMessage, ClientError> {
        loop {
            if let Some(frame) = self.decoder.decode_frame()? {
                let header = MessageHeader::decode(&frame)?;
                if header.op_code != OpCode::Reply {
                    return Err(ClientError::UnexpectedOpCode(header.op_code as i32));
                }
                return Ok(ReplyMessage::decode(&frame)?);
            }

            let n = self.stream.read(&mut self.read_buf).await?;
            tracing::debug!("Read {} bytes from socket", n);
            if n == 0 {
                tracing::debug!("Connection closed (0 bytes)");
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }
}

/// The session lock held for one exchange.
///
/// Dropped while armed, it discards the session and marks the connection
/// disconnected: the stream may hold half a request or an unread reply.
/// This includes a caller abandoning the future mid-exchange.
struct Exchange<'a> {
    session: MutexGuard<'a, Option<Session>>,
    connected: &'a AtomicBool,
    armed: bool,
}

impl Exchange<'_> {
    fn session(&mut self) -> Result<&mut Session, ClientError> {
        self.session.as_mut().ok_or(ClientError::NotConnected)
    }

    /// The stream is back in step; keep the session.
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if self.armed && self.session.take().is_some() {
            self.connected.store(false, Ordering::SeqCst);
            tracing::debug!("Exchange did not complete; dropping connection");
        }
    }
}

/// A session with one server for one database.
///
/// Every exchange holds the session lock from the first byte written until
/// the reply has been read, so at most one request is in flight and replies
/// can never be handed to the wrong caller.
pub struct Connection {
    config: ConnectionConfig,
    session: Mutex<Option<Session>>,
    /// Request ids come from the process-wide counter unless one is injected.
    request_ids: Option<Arc<RequestIdGenerator>>,
    connected: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            request_ids: None,
            connected: AtomicBool::new(false),
        }
    }

    /// Wraps an already-established stream. The connection starts connected.
    pub fn from_stream(config: ConnectionConfig, stream: impl Transport + 'static) -> Self {
        let session = Session::new(ClientStream::custom(stream), config.read_buffer_size);
        Self {
            config,
            session: Mutex::new(Some(session)),
            request_ids: None,
            connected: AtomicBool::new(true),
        }
    }

    /// Draws request ids from `generator` instead of the process-wide counter.
    pub fn with_request_id_generator(mut self, generator: Arc<RequestIdGenerator>) -> Self {
        self.request_ids = Some(generator);
        self
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        validate_database_name(&self.config.database)?;
        tracing::debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        if self.config.tcp_nodelay {
            tcp_stream.set_nodelay(true).ok();
        }

        let session = Session::new(tcp_stream.into(), self.config.read_buffer_size);
        *self.session.lock().await = Some(session);
        self.connected.store(true, Ordering::SeqCst);

        tracing::info!(
            "Connected to {} (database {})",
            self.config.addr,
            self.config.database
        );
        Ok(())
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    fn next_request_id(&self) -> i32 {
        match &self.request_ids {
            Some(generator) => generator.next_id(),
            None => next_request_id(),
        }
    }

    async fn begin(&self) -> Exchange<'_> {
        Exchange {
            session: self.session.lock().await,
            connected: &self.connected,
            armed: true,
        }
    }

    /// Writes a request without reading anything back.
    ///
    /// Requests that the server answers (query, get-more) are exchanged and
    /// their reply discarded so the stream stays in step.
    pub async fn send(&self, request: &Request) -> Result<(), ClientError> {
        if request.expects_reply() {
            self.request(request).await?;
            return Ok(());
        }
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let request_id = self.next_request_id();
        let encoded = request.encode(request_id)?;

        let mut exchange = self.begin().await;
        let session = exchange.session()?;
        tracing::debug!(
            "Sending {} id={} ({} bytes)",
            request.op_code(),
            request_id,
            encoded.len()
        );

        let write = session.write(&encoded);
        let outcome = tokio::time::timeout(self.config.request_timeout, write).await;
        match outcome {
            Ok(Ok(())) => {
                exchange.complete();
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::debug!("Write for id={} failed: {}", request_id, e);
                Err(e)
            }
            Err(_) => {
                tracing::debug!("Write for id={} timed out", request_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends a request and waits for its reply.
    ///
    /// A reply with non-zero flags becomes [`ClientError::QueryFailure`]
    /// carrying the server's error document.
    pub async fn request(&self, request: &Request) -> Result<ReplyMessage, ClientError> {
        if !self.is_connected() {
            tracing::debug!("request() called but not connected");
            return Err(ClientError::NotConnected);
        }

        let request_id = self.next_request_id();
        let encoded = request.encode(request_id)?;

        let mut exchange = self.begin().await;
        let session = exchange.session()?;
        tracing::debug!(
            "Sending {} id={} ({} bytes), waiting for reply...",
            request.op_code(),
            request_id,
            encoded.len()
        );

        let round_trip = async {
            session.write(&encoded).await?;
            session.read_reply().await
        };
        let outcome = tokio::time::timeout(self.config.request_timeout, round_trip).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::debug!("Request id={} failed: {}", request_id, e);
                return Err(e);
            }
            Err(_) => {
                tracing::debug!("Request id={} timed out", request_id);
                return Err(ClientError::Timeout);
            }
        };

        let response_to = reply.header.response_to;
        if self.config.verify_response_to && response_to != request_id {
            tracing::warn!(
                "Reply answers request {} but request {} was sent; dropping connection",
                response_to,
                request_id
            );
            return Err(ClientError::ResponseMismatch {
                expected: request_id,
                actual: response_to,
            });
        }
        exchange.complete();

        tracing::debug!(
            "Request id={} got reply: {} documents, cursor id {}",
            request_id,
            reply.documents.len(),
            reply.cursor_id
        );

        if reply.is_query_failure() {
            let flags = reply.flags;
            let error = reply.documents.into_iter().next().unwrap_or_default();
            return Err(ClientError::QueryFailure { flags, error });
        }
        Ok(reply)
    }

    /// Runs a database command and returns its result document.
    ///
    /// The command is queried against `<database>.$cmd` with one document
    /// requested; a result whose `ok` field is not 1 is a failure.
    pub async fn command(&self, command: Selector) -> Result<Document, ClientError> {
        let namespace = Namespace::command(self.database())?;
        let name = command.first_key().unwrap_or_default().to_string();
        let message = QueryMessage::from_query(namespace, &Query::command(command));

        let reply = self.request(&Request::Query(message)).await?;
        let result = reply.documents.into_iter().next().unwrap_or_default();
        if command_succeeded(&result) {
            Ok(result)
        } else {
            tracing::debug!("Command {} failed: {}", name, result);
            Err(ClientError::CommandFailed {
                command: name,
                result,
            })
        }
    }

    /// Runs a query and returns a cursor over its results.
    pub async fn query(
        self: &Arc<Self>,
        collection: &str,
        query: &Query,
    ) -> Result<Cursor, ClientError> {
        let namespace = Namespace::new(self.database(), collection)?;
        let message = QueryMessage::from_query(namespace.clone(), query);
        let reply = self.request(&Request::Query(message)).await?;
        Ok(Cursor::new(Arc::clone(self), namespace, query, reply))
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut session) = self.session.lock().await.take() {
            let _ = session.stream.shutdown().await;
            tracing::info!("Connection to {} closed", self.config.addr);
        }
        Ok(())
    }
}

/// `ok` may come back as a double, an int or a boolean depending on the server.
fn command_succeeded(result: &Document) -> bool {
    match result.get("ok") {
        Some(Value::Boolean(ok)) => *ok,
        Some(value) => value.as_f64() == Some(1.0),
        None => false,
    }
}

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
