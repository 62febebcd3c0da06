//! Application-facing tunnel connection

use super::{StreamPipe, TunnelError};
use std::any::Any;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Identity of a session: the remote host and the ICMP identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub addr: IpAddr,
    pub id: u16,
}

impl SessionKey {
    pub fn new(addr: IpAddr, id: u16) -> Self {
        Self { addr, id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.id)
    }
}

/// A duplex byte stream carried by a tunnel session
///
/// Cloning yields another handle onto the same stream. Writes only append
/// to the outbound buffer, so they never wait for the network.
#[derive(Clone)]
pub struct Connection {
    pipe: Arc<StreamPipe>,
    local: IpAddr,
    remote: SessionKey,
    keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

impl Connection {
    pub(crate) fn new(pipe: Arc<StreamPipe>, local: IpAddr, remote: SessionKey) -> Self {
        Self {
            pipe,
            local,
            remote,
            keepalive: None,
        }
    }

    /// Keep `owner` alive for as long as any handle to this connection exists
    pub(crate) fn with_keepalive(mut self, owner: Arc<dyn Any + Send + Sync>) -> Self {
        self.keepalive = Some(owner);
        self
    }

    /// Read available bytes, waiting until some arrive
    ///
    /// Returns `Ok(0)` once the connection is closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.pipe.read(buf).await)
    }

    /// Queue `data` for sending
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.pipe.write(data).map_err(broken_pipe)
    }

    /// Close the connection; a second close reports `AlreadyClosed`
    pub fn close(&self) -> Result<(), TunnelError> {
        self.pipe.close()
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.is_closed()
    }

    /// Wait until the connection is closed from either side
    pub async fn closed(&self) {
        self.pipe.closed().await
    }

    /// Local transport address
    pub fn local_addr(&self) -> IpAddr {
        self.local
    }

    /// Remote host address
    pub fn remote_addr(&self) -> IpAddr {
        self.remote.addr
    }

    /// Remote session identity
    pub fn session_key(&self) -> SessionKey {
        self.remote
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.pipe.is_closed())
            .finish()
    }
}

fn broken_pipe(_: TunnelError) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        match self.pipe.poll_read(cx, unfilled) {
            Poll::Ready(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.pipe.write(buf).map_err(broken_pipe))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = self.pipe.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn connection() -> Connection {
        connection_with_pipe().0
    }

    fn connection_with_pipe() -> (Connection, Arc<StreamPipe>) {
        let key = SessionKey::new("10.0.0.2".parse().unwrap(), 7);
        let pipe = Arc::new(StreamPipe::new());
        let conn = Connection::new(Arc::clone(&pipe), "10.0.0.1".parse().unwrap(), key);
        (conn, pipe)
    }

    #[tokio::test]
    async fn test_async_io_over_pipe() {
        let (mut conn, pipe) = connection_with_pipe();

        conn.write_all(b"out").await.unwrap();
        assert_eq!(&pipe.drain_outbound(16).unwrap()[..], b"out");

        pipe.push_inbound(Bytes::from_static(b"in")).unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"in");
    }

    #[tokio::test]
    async fn test_clones_share_stream() {
        let conn = connection();
        let other = conn.clone();

        other.close().unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.close(), Err(TunnelError::AlreadyClosed)));

        let err = conn.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_shutdown_gives_eof() {
        let mut conn = connection();
        conn.shutdown().await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(conn.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_accessors() {
        let conn = connection();
        assert_eq!(conn.local_addr(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(conn.remote_addr(), "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(conn.session_key().to_string(), "10.0.0.2#7");
    }
}
