//! Tunnel layer - byte streams over ICMP echo rounds
//!
//! Provides:
//! - Stream pipes bridging stream I/O and packets
//! - Stop-and-wait sessions (initiator and responder)
//! - Session table, listener and client hosts
//! - Optional encrypted record channel

mod client;
mod connection;
mod listener;
mod pipe;
mod secure;
mod session;
mod table;

pub use client::Client;
pub use connection::{Connection, SessionKey};
pub use listener::Listener;
pub use pipe::StreamPipe;
pub use secure::SecureChannel;
pub use session::Role;

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream already closed")]
    AlreadyClosed,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Record timed out")]
    RecordTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// Open a tunnel connection to `remote` on a new raw ICMP socket
///
/// Each call starts its own [`Client`] host; use [`Client::connect`] to open
/// several connections over one socket.
///
/// With a key, the returned connection is wrapped in a [`SecureChannel`].
/// The host stays alive for as long as the connection (or any clone of it)
/// does.
pub async fn connect(remote: IpAddr, key: Option<&[u8]>) -> crate::Result<Connection> {
    let client = Arc::new(Client::new()?);
    let conn = client.connect(remote, key)?;
    Ok(conn.with_keepalive(client))
}

/// Start accepting tunnel connections on a new raw ICMP socket
///
/// With a key, every accepted connection is wrapped in a [`SecureChannel`].
pub async fn listen(key: Option<&[u8]>) -> crate::Result<Listener> {
    Ok(Listener::bind(key)?)
}
