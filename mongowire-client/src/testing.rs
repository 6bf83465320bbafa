//! Scripted in-process server for exercising the client over real sockets.

use crate::connection::{Connection, ConnectionConfig};
use mongowire_protocol::{Document, Message, MessageDecoder, MessageHeader, ReplyMessage, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// What the server does with one incoming request.
pub(crate) enum Action {
    /// Answer with this reply, `responseTo` set to the request id.
    Reply(ReplyMessage),
    /// Write these bytes verbatim.
    Raw(Vec<u8>),
    /// Send nothing back.
    Silent,
    /// Close the socket.
    Hangup,
}

impl Action {
    pub(crate) fn documents(cursor_id: i64, documents: Vec<Document>) -> Self {
        Action::Reply(ReplyMessage::new(cursor_id, 0, documents))
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<(MessageHeader, Request)>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Accepts a single connection and answers each request with `handler`.
    pub(crate) async fn start<F>(mut handler: F) -> Self
    where
        F: FnMut(&Request) -> Action + Send + 'static,
    {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, requests) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut decoder = MessageDecoder::new();
            let mut buf = vec![0u8; 4096];
            let mut next_id = 1000;

            loop {
                while let Some(message) = decoder.decode_message().unwrap() {
                    let Message::Request { header, request } = message else {
                        panic!("client sent a reply");
                    };
                    let action = handler(&request);
                    let _ = tx.send((header, request));
                    match action {
                        Action::Reply(reply) => {
                            next_id += 1;
                            let bytes = reply.encode(next_id, header.request_id).unwrap();
                            socket.write_all(&bytes).await.unwrap();
                        }
                        Action::Raw(bytes) => socket.write_all(&bytes).await.unwrap(),
                        Action::Silent => {}
                        Action::Hangup => return,
                    }
                }

                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => decoder.extend(&buf[..n]),
                }
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub(crate) fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.addr, "test").with_request_timeout(Duration::from_secs(5))
    }

    pub(crate) async fn connect(&self) -> Arc<Connection> {
        let conn = Connection::new(self.config());
        conn.connect().await.unwrap();
        Arc::new(conn)
    }

    /// Waits for the next request the server received.
    pub(crate) async fn next_request(&mut self) -> (MessageHeader, Request) {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no request within 5s")
            .expect("server task ended")
    }

    /// Requests received so far, without waiting.
    pub(crate) fn received(&mut self) -> Vec<(MessageHeader, Request)> {
        let mut out = Vec::new();
        while let Ok(entry) = self.requests.try_recv() {
            out.push(entry);
        }
        out
    }
}

/// Honors `RUST_LOG` in test output; later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
