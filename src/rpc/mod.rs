//! File transfer RPC over tunnel connections
//!
//! Frames are a 4-byte big-endian length followed by a JSON document.
//! File contents travel base64-encoded inside the JSON.

use crate::tunnel::{Connection, Listener, TunnelError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Largest accepted frame (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// RPC errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Server error: {0}")]
    Remote(String),

    #[error("Unexpected response")]
    UnexpectedResponse,

    #[error("Connection closed")]
    Closed,

    #[error("No response within {0:?}")]
    Timeout(Duration),
}

/// Client requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Upload {
        name: String,
        #[serde(with = "base64_data")]
        data: Vec<u8>,
    },
    Download {
        name: String,
    },
    Version,
}

/// Server responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Done,
    File {
        name: String,
        #[serde(with = "base64_data")]
        data: Vec<u8>,
    },
    Version(String),
    Error(String),
}

mod base64_data {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream between frames
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(RpcError::Closed);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Reduce a client-supplied name to its final path component
fn base_name(name: &str) -> Result<String, RpcError> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| RpcError::InvalidName(name.to_string()))
}

/// Serves uploads, downloads and version queries from one directory
#[derive(Debug, Clone)]
pub struct RpcServer {
    dir: PathBuf,
}

impl RpcServer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Accept connections until the listener closes, one task each
    pub async fn serve(&self, listener: &Listener) -> Result<(), TunnelError> {
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(TunnelError::ListenerClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            info!("New RPC connection: {}", conn.session_key());

            let server = self.clone();
            tokio::spawn(async move {
                let key = conn.session_key();
                match server.serve_connection(conn).await {
                    Ok(()) => debug!("RPC connection {} ended", key),
                    Err(e) => warn!("RPC connection {} dropped: {}", key, e),
                }
            });
        }
    }

    /// Answer requests on one connection until it ends
    ///
    /// The connection is closed on return, whether or not it failed.
    pub async fn serve_connection(&self, mut conn: Connection) -> Result<(), RpcError> {
        let result = self.answer(&mut conn).await;
        let _ = conn.close();
        result
    }

    async fn answer(&self, conn: &mut Connection) -> Result<(), RpcError> {
        while let Some(request) = read_frame::<_, Request>(conn).await? {
            let response = self.handle(request).await;
            write_frame(conn, &response).await?;
        }
        Ok(())
    }

    /// Execute one request
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Upload { name, data } => match self.store(&name, &data).await {
                Ok(path) => {
                    info!("File upload: {} -> {}", name, path.display());
                    Response::Done
                }
                Err(e) => {
                    warn!("Upload of {:?} failed: {}", name, e);
                    Response::Error(e.to_string())
                }
            },
            Request::Download { name } => match self.load(&name).await {
                Ok((name, data)) => {
                    info!("File download: {}", name);
                    Response::File { name, data }
                }
                Err(e) => Response::Error(e.to_string()),
            },
            Request::Version => {
                debug!("Version request");
                Response::Version(crate::VERSION.to_string())
            }
        }
    }

    async fn store(&self, name: &str, data: &[u8]) -> Result<PathBuf, RpcError> {
        let base = base_name(name)?;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let path = self.dir.join(format!("{}-{}", secs, base));
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    async fn load(&self, name: &str) -> Result<(String, Vec<u8>), RpcError> {
        let base = base_name(name)?;
        let data = tokio::fs::read(self.dir.join(&base)).await?;
        Ok((base, data))
    }
}

/// Issues requests over a single connection
///
/// A closed server session is not signalled to the client, so a call can
/// wait indefinitely unless a timeout is set.
pub struct RpcClient {
    conn: Connection,
    timeout: Option<Duration>,
}

impl RpcClient {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            timeout: None,
        }
    }

    /// Bound the wait for each response; on expiry the connection is closed
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn call(&mut self, request: &Request) -> Result<Response, RpcError> {
        write_frame(&mut self.conn, request).await?;

        let response = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, read_frame(&mut self.conn)).await {
                Ok(response) => response?,
                Err(_) => {
                    let _ = self.conn.close();
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => read_frame(&mut self.conn).await?,
        };

        match response {
            Some(Response::Error(message)) => Err(RpcError::Remote(message)),
            Some(response) => Ok(response),
            None => Err(RpcError::Closed),
        }
    }

    /// Upload a local file under its base name
    pub async fn upload(&mut self, path: impl AsRef<Path>) -> Result<(), RpcError> {
        let path = path.as_ref();
        let name = base_name(&path.to_string_lossy())?;
        let data = tokio::fs::read(path).await?;

        match self.call(&Request::Upload { name, data }).await? {
            Response::Done => Ok(()),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Download `name` into `dir`, returning the written path
    pub async fn download(&mut self, name: &str, dir: impl AsRef<Path>) -> Result<PathBuf, RpcError> {
        let request = Request::Download {
            name: name.to_string(),
        };

        match self.call(&request).await? {
            Response::File { name, data } => {
                let path = dir.as_ref().join(base_name(&name)?);
                tokio::fs::write(&path, data).await?;
                Ok(path)
            }
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Query the server's version string
    pub async fn version(&mut self) -> Result<String, RpcError> {
        match self.call(&Request::Version).await? {
            Response::Version(version) => Ok(version),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Close the underlying connection
    pub fn close(&self) {
        let _ = self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{SessionKey, StreamPipe};
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn test_base_name_strips_directories() {
        assert_eq!(base_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(base_name("report.txt").unwrap(), "report.txt");
        assert!(base_name("..").is_err());
        assert!(base_name("").is_err());
    }

    #[test]
    fn test_file_data_is_base64_in_json() {
        let request = Request::Upload {
            name: "a.bin".to_string(),
            data: vec![0, 255, 16],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"AP8Q\""));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Response::Version("1.2.3".to_string()))
            .await
            .unwrap();
        drop(a);

        let got: Option<Response> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(Response::Version("1.2.3".to_string())));

        let end: Option<Response> = read_frame(&mut b).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let result: Result<Option<Request>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(RpcError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_handle_upload_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let server = RpcServer::new(dir.path());

        let response = server
            .handle(Request::Upload {
                name: "notes/hello.txt".to_string(),
                data: b"hi there".to_vec(),
            })
            .await;
        assert_eq!(response, Response::Done);

        let stored: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].ends_with("-hello.txt"));

        let response = server
            .handle(Request::Download {
                name: stored[0].clone(),
            })
            .await;
        assert_eq!(
            response,
            Response::File {
                name: stored[0].clone(),
                data: b"hi there".to_vec(),
            }
        );

        let missing = server
            .handle(Request::Download {
                name: "nope".to_string(),
            })
            .await;
        assert!(matches!(missing, Response::Error(_)));
    }

    fn pipe_connection() -> (Connection, Arc<StreamPipe>) {
        let pipe = Arc::new(StreamPipe::new());
        let key = SessionKey::new("10.0.0.2".parse().unwrap(), 3);
        let conn = Connection::new(Arc::clone(&pipe), "10.0.0.1".parse().unwrap(), key);
        (conn, pipe)
    }

    #[tokio::test]
    async fn test_malformed_request_closes_connection() {
        let (conn, pipe) = pipe_connection();
        let mut frame = 3u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"{{{");
        pipe.push_inbound(Bytes::from(frame)).unwrap();

        let server = RpcServer::new(".");
        let result = tokio::time::timeout(Duration::from_secs(1), server.serve_connection(conn))
            .await
            .unwrap();

        assert!(matches!(result, Err(RpcError::Json(_))));
        assert!(pipe.is_closed());
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let (conn, pipe) = pipe_connection();
        let mut rpc = RpcClient::new(conn).with_timeout(Duration::from_millis(50));

        let result = rpc.version().await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));
        assert!(pipe.is_closed());

        assert!(matches!(rpc.version().await, Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_handle_version() {
        let server = RpcServer::new(".");
        assert_eq!(
            server.handle(Request::Version).await,
            Response::Version(crate::VERSION.to_string())
        );
    }
}
