//! Client host: initiator sessions sharing one transport

use super::session::{Role, TunnelSession};
use super::table::{Entry, Lookup, SessionTable};
use super::{Connection, SecureChannel, SessionKey, StreamPipe, TunnelError};
use crate::config::TunnelConfig;
use crate::crypto::Cipher;
use crate::transport::{Datagram, MessageKind, PacketSink, PacketTransport};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, trace};

/// Owns a transport and the initiator sessions opened over it
///
/// Dropping the client stops its receive loop and closes every session it
/// opened, so keep it alive while its connections are in use.
pub struct Client {
    transport: PacketTransport,
    table: Arc<SessionTable>,
    config: Arc<TunnelConfig>,
    recv_task: JoinHandle<()>,
}

impl Client {
    /// Create a client on the process-wide raw ICMP socket
    pub fn new() -> crate::Result<Self> {
        let transport = PacketTransport::open_raw()?;
        Self::start(transport, TunnelConfig::default())
    }

    /// Create a client over an arbitrary datagram socket
    pub fn with_transport(socket: Arc<dyn Datagram>, config: TunnelConfig) -> crate::Result<Self> {
        Self::start(PacketTransport::new(socket), config)
    }

    fn start(transport: PacketTransport, config: TunnelConfig) -> crate::Result<Self> {
        config.validate()?;

        let table = SessionTable::new();
        let recv_task = {
            let transport = transport.clone();
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                transport
                    .run(MessageKind::EchoReply, |from, reply| {
                        let key = SessionKey::new(from, reply.id);
                        if let Err(reply) = table.route(&key, reply) {
                            trace!("No session for reply {} seq {}", key, reply.seq);
                        }
                    })
                    .await;
                table.close_all();
            })
        };

        Ok(Self {
            transport,
            table,
            config: Arc::new(config),
            recv_task,
        })
    }

    /// Open a connection to `remote`, optionally encrypted with `key`
    pub fn connect(&self, remote: IpAddr, key: Option<&[u8]>) -> crate::Result<Connection> {
        let cipher = key.map(Cipher::new).transpose()?.map(Arc::new);

        // Identifiers only need to be unique among this client's sessions
        let session_key = loop {
            let candidate = SessionKey::new(remote, rand::random::<u16>());
            if !self.table.contains(&candidate) {
                break candidate;
            }
        };

        let lookup = self
            .table
            .lookup_or_create(session_key, |cleanup| {
                let (inbox, inbox_rx) = mpsc::channel(self.config.inbox_capacity);
                let pipe = Arc::new(StreamPipe::new());
                let raw = Connection::new(Arc::clone(&pipe), self.transport.local_addr(), session_key);

                TunnelSession::new(
                    Role::Initiator,
                    session_key,
                    Arc::clone(&pipe),
                    Arc::new(self.transport.clone()),
                    inbox_rx,
                    Arc::clone(&self.config),
                    cleanup,
                )
                .spawn();

                let connection = match &cipher {
                    Some(cipher) => SecureChannel::wrap(raw, Arc::clone(cipher), &self.config),
                    None => raw,
                };
                Ok::<_, TunnelError>(Entry {
                    inbox,
                    pipe,
                    connection,
                })
            })?;

        match lookup {
            Lookup::Created(_, connection) => {
                info!("Opened session {}", session_key);
                Ok(connection)
            }
            Lookup::Existing(_) => Err(crate::Error::Config(format!(
                "session {} already exists",
                session_key
            ))),
        }
    }

    /// Local transport address
    pub fn local_addr(&self) -> IpAddr {
        self.transport.local_addr()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.table.live_count()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.recv_task.abort();
        self.table.close_all();
    }
}
