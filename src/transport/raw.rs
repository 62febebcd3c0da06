//! Raw ICMPv4 socket
//!
//! Opening the socket needs CAP_NET_RAW (or root). On the server host the
//! kernel's own echo responder must be disabled
//! (`net.ipv4.icmp_echo_ignore_all = 1`), otherwise clients receive the
//! kernel's mirrored replies alongside the tunnel's.

use super::{Datagram, TransportError};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::trace;

/// Minimum IPv4 header length
const IPV4_MIN_HEADER: usize = 20;

/// Raw ICMPv4 socket driven by the tokio reactor
pub struct RawIcmpSocket {
    socket: UdpSocket,
    local: IpAddr,
}

impl RawIcmpSocket {
    /// Open a raw ICMP socket bound to `addr` (use `0.0.0.0` for all interfaces)
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: Ipv4Addr) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
            TransportError::SocketUnavailable(format!("raw ICMP socket: {}", e))
        })?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(IpAddr::V4(addr), 0).into())?;

        // The datagram API of a UDP socket works unchanged on a raw socket fd;
        // ports are ignored by the kernel.
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self {
            socket,
            local: IpAddr::V4(addr),
        })
    }
}

#[async_trait]
impl Datagram for RawIcmpSocket {
    async fn send_to(&self, data: &[u8], dest: IpAddr) -> Result<(), TransportError> {
        self.socket.send_to(data, SocketAddr::new(dest, 0)).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, IpAddr), TransportError> {
        loop {
            let (n, from) = self.socket.recv_from(buf).await?;

            // IPv4 raw sockets deliver the IP header in front of the ICMP message
            if n < IPV4_MIN_HEADER || buf[0] >> 4 != 4 {
                trace!("Dropping non-IPv4 datagram from {} ({} bytes)", from.ip(), n);
                continue;
            }
            let header_len = ((buf[0] & 0x0F) as usize) * 4;
            if header_len < IPV4_MIN_HEADER || header_len > n {
                trace!("Dropping datagram with bad IHL from {}", from.ip());
                continue;
            }

            buf.copy_within(header_len..n, 0);
            return Ok((n - header_len, from.ip()));
        }
    }

    fn local_addr(&self) -> IpAddr {
        self.local
    }
}
