//! Client stream abstraction over plain TCP and caller-supplied transports.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Any byte stream a session can run over (in-memory pipes, tunnels, mocks).
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pin_project! {
    /// The stream owned by a session.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Tcp { #[pin] stream: TcpStream },
        Custom { stream: Box<dyn Transport> },
    }
}

impl ClientStream {
    pub fn custom(stream: impl Transport + 'static) -> Self {
        ClientStream::Custom {
            stream: Box::new(stream),
        }
    }

    /// Returns whether this stream is a TCP socket.
    pub fn is_tcp(&self) -> bool {
        matches!(self, ClientStream::Tcp { .. })
    }
}

impl From<TcpStream> for ClientStream {
    fn from(stream: TcpStream) -> Self {
        ClientStream::Tcp { stream }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Custom { stream } => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Custom { stream } => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_flush(cx),
            ClientStreamProj::Custom { stream } => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Custom { stream } => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
