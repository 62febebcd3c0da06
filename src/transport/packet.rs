//! Packet transport shared by all sessions of one host

use super::{Datagram, Message, MessageKind, PacketSink, RawIcmpSocket, TransportError};
use crate::protocol::RECV_BUFFER_SIZE;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{error, trace};

/// Marshals tunnel messages onto a datagram socket and runs the receive loop
#[derive(Clone)]
pub struct PacketTransport {
    socket: Arc<dyn Datagram>,
}

impl PacketTransport {
    /// Wrap an existing datagram socket
    pub fn new(socket: Arc<dyn Datagram>) -> Self {
        Self { socket }
    }

    /// Open the process-wide raw ICMP socket on all interfaces
    pub fn open_raw() -> Result<Self, TransportError> {
        let socket = RawIcmpSocket::bind(Ipv4Addr::UNSPECIFIED)?;
        Ok(Self::new(Arc::new(socket)))
    }

    /// Read datagrams forever, handing well-formed messages of the expected
    /// kind to `dispatch`.
    ///
    /// Malformed and mistyped packets are dropped. Returns only when the
    /// socket fails, with the error that ended the loop.
    pub async fn run<F>(&self, expected: MessageKind, mut dispatch: F) -> TransportError
    where
        F: FnMut(IpAddr, Message) + Send,
    {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Receive loop stopped: {}", e);
                    return e;
                }
            };

            let message = match Message::decode(&buf[..n]) {
                Ok(message) => message,
                Err(e) => {
                    trace!("Dropping packet from {}: {}", from, e);
                    continue;
                }
            };

            if message.kind != expected {
                trace!("Dropping {:?} from {} (expected {:?})", message.kind, from, expected);
                continue;
            }

            dispatch(from, message);
        }
    }
}

#[async_trait]
impl PacketSink for PacketTransport {
    async fn send(&self, to: IpAddr, message: &Message) -> Result<(), TransportError> {
        let encoded = message.encode();
        self.socket.send_to(&encoded, to).await
    }

    fn local_addr(&self) -> IpAddr {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_run_filters_kind_and_garbage() {
        let network = MemoryNetwork::new();
        let server_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let client_ip: IpAddr = "10.0.0.2".parse().unwrap();

        let server = PacketTransport::new(Arc::new(network.endpoint(server_ip)));
        let client = network.endpoint(client_ip);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let loop_transport = server.clone();
        tokio::spawn(async move {
            loop_transport
                .run(MessageKind::Echo, move |from, msg| {
                    let _ = tx.send((from, msg));
                })
                .await
        });

        // Garbage, a mistyped reply, then a valid echo
        client.send_to(b"\x01\x02", server_ip).await.unwrap();
        let reply = Message::echo(1, 1, Bytes::new()).reply(Bytes::from_static(b"no"));
        client.send_to(&reply.encode(), server_ip).await.unwrap();
        let echo = Message::echo(1, 1, Bytes::from_static(b"yes"));
        client.send_to(&echo.encode(), server_ip).await.unwrap();

        let (from, msg) = rx.recv().await.unwrap();
        assert_eq!(from, client_ip);
        assert_eq!(msg, echo);
        assert!(rx.try_recv().is_err());
    }
}
