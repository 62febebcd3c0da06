//! Transport layer implementations
//!
//! Provides:
//! - ICMP Echo / Echo Reply message encoding
//! - Raw ICMPv4 socket (requires CAP_NET_RAW or root)
//! - In-memory datagram network for tests and in-process links
//! - The packet transport shared by every session of a host

mod icmp;
mod memory;
mod packet;
mod raw;

pub use icmp::{checksum, Message, MessageKind};
pub use memory::{FaultConfig, MemoryEndpoint, MemoryNetwork};
pub use packet::PacketTransport;
pub use raw::RawIcmpSocket;

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Socket unavailable: {0}")]
    SocketUnavailable(String),

    #[error("Host unreachable: {0}")]
    Unreachable(IpAddr),

    #[error("Transport closed")]
    Closed,
}

/// A connectionless datagram socket carrying raw ICMP messages
///
/// Implementations hand out ICMP bytes only; any IP header delivered by the
/// operating system is stripped before `recv_from` returns.
#[async_trait]
pub trait Datagram: Send + Sync {
    /// Send one ICMP message to `dest`
    async fn send_to(&self, data: &[u8], dest: IpAddr) -> Result<(), TransportError>;

    /// Receive one ICMP message, returning its length and source address
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, IpAddr), TransportError>;

    /// Local address the socket is bound to
    fn local_addr(&self) -> IpAddr;
}

/// Outbound half of a transport, as seen by a single session
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Marshal and send a message; failure is fatal for the caller
    async fn send(&self, to: IpAddr, message: &Message) -> Result<(), TransportError>;

    /// Local transport endpoint
    fn local_addr(&self) -> IpAddr;
}
