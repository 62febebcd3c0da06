//! # ICMP Tunnel
//!
//! Ordinary byte-stream connections carried inside ICMP Echo Request/Reply
//! packets, for networks where ping is the only traffic allowed through.
//!
//! ## Features
//!
//! - **Stop-and-wait transport** with retransmission and duplicate suppression
//! - **One raw socket per process**, multiplexed into many sessions
//! - **Optional AES-GCM record encryption** on top of the tunnel stream
//! - **Listener / Connection API** so existing protocols run unmodified
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │            (File RPC, broadcast relay)              │
//! ├─────────────────────────────────────────────────────┤
//! │                   Secure Channel                     │
//! │        (AES-GCM, length-framed records)             │
//! ├─────────────────────────────────────────────────────┤
//! │                 Session Table / Host                 │
//! │        (one session per remote endpoint)            │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Session                     │
//! │     (stop-and-wait rounds, piggybacked replies)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Packet Transport                    │
//! │          (raw ICMPv4 socket, Echo codec)            │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn run() -> icmp_tunnel::Result<()> {
//! let listener = icmp_tunnel::listen(None).await?;
//! let mut conn = listener.accept().await?;
//! let mut buf = [0u8; 1024];
//! let n = conn.read(&mut buf).await?;
//! conn.write_all(&buf[..n]).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod rpc;
pub mod transport;
pub mod tunnel;

pub use config::{Config, TunnelConfig};
pub use tunnel::{connect, listen, Client, Connection, Listener};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
