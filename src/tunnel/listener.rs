//! Server host: accepts tunnel connections from Echo Requests

use super::session::{Role, TunnelSession};
use super::table::{Entry, Lookup, SessionTable};
use super::{Connection, SecureChannel, SessionKey, StreamPipe, TunnelError};
use crate::config::TunnelConfig;
use crate::crypto::Cipher;
use crate::transport::{Datagram, Message, MessageKind, PacketSink, PacketTransport};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Accepts one connection per remote `(address, identifier)` pair
pub struct Listener {
    transport: PacketTransport,
    table: Arc<SessionTable>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    closed: Arc<AtomicBool>,
    closed_notify: Notify,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

/// State the receive loop needs to open sessions
struct Acceptor {
    transport: PacketTransport,
    table: Arc<SessionTable>,
    accept_tx: mpsc::Sender<Connection>,
    cipher: Option<Arc<Cipher>>,
    config: Arc<TunnelConfig>,
    closed: Arc<AtomicBool>,
}

impl Acceptor {
    fn handle_echo(&self, from: IpAddr, echo: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let key = SessionKey::new(from, echo.id);
        let echo = match self.table.route(&key, echo) {
            Ok(()) => return,
            Err(echo) => echo,
        };

        match self.table.lookup_or_create(key, |cleanup| self.open_session(key, cleanup)) {
            Ok(Lookup::Existing(inbox)) => {
                let _ = inbox.try_send(echo);
            }
            Ok(Lookup::Created(inbox, connection)) => {
                info!("New connection from {}", key);
                let _ = inbox.try_send(echo);

                match self.accept_tx.try_send(connection) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Accept queue full, dropping connection {}", key)
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            Err(e) => warn!("Failed to open session {}: {}", key, e),
        }
    }

    fn open_session(&self, key: SessionKey, cleanup: super::session::Cleanup) -> Result<Entry, TunnelError> {
        let (inbox, inbox_rx) = mpsc::channel(self.config.inbox_capacity);
        let pipe = Arc::new(StreamPipe::new());
        let raw = Connection::new(Arc::clone(&pipe), self.transport.local_addr(), key);

        TunnelSession::new(
            Role::Responder,
            key,
            Arc::clone(&pipe),
            Arc::new(self.transport.clone()),
            inbox_rx,
            Arc::clone(&self.config),
            cleanup,
        )
        .spawn();

        let connection = match &self.cipher {
            Some(cipher) => SecureChannel::wrap(raw, Arc::clone(cipher), &self.config),
            None => raw,
        };

        Ok(Entry {
            inbox,
            pipe,
            connection,
        })
    }
}

impl Listener {
    /// Listen on the process-wide raw ICMP socket
    pub fn bind(key: Option<&[u8]>) -> crate::Result<Self> {
        let transport = PacketTransport::open_raw()?;
        Self::start(transport, key, TunnelConfig::default())
    }

    /// Listen on an arbitrary datagram socket
    pub fn bind_with(
        socket: Arc<dyn Datagram>,
        key: Option<&[u8]>,
        config: TunnelConfig,
    ) -> crate::Result<Self> {
        Self::start(PacketTransport::new(socket), key, config)
    }

    fn start(transport: PacketTransport, key: Option<&[u8]>, config: TunnelConfig) -> crate::Result<Self> {
        config.validate()?;
        let cipher = key.map(Cipher::new).transpose()?.map(Arc::new);

        let table = SessionTable::new();
        let closed = Arc::new(AtomicBool::new(false));
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let acceptor = Acceptor {
            transport: transport.clone(),
            table: Arc::clone(&table),
            accept_tx,
            cipher,
            config: Arc::new(config),
            closed: Arc::clone(&closed),
        };

        let recv_task = tokio::spawn(async move {
            acceptor
                .transport
                .run(MessageKind::Echo, |from, echo| acceptor.handle_echo(from, echo))
                .await;
            acceptor.table.close_all();
        });

        info!("Listening on {}", transport.local_addr());

        Ok(Self {
            transport,
            table,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed,
            closed_notify: Notify::new(),
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    /// Wait for the next new connection
    ///
    /// Fails with `ListenerClosed` once the listener is closed, including
    /// for calls already waiting.
    pub async fn accept(&self) -> Result<Connection, TunnelError> {
        let notified = self.closed_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(TunnelError::ListenerClosed);
        }

        let mut accept_rx = tokio::select! {
            _ = notified.as_mut() => return Err(TunnelError::ListenerClosed),
            rx = self.accept_rx.lock() => rx,
        };
        if self.is_closed() {
            return Err(TunnelError::ListenerClosed);
        }

        tokio::select! {
            _ = notified => Err(TunnelError::ListenerClosed),
            conn = accept_rx.recv() => conn.ok_or(TunnelError::ListenerClosed),
        }
    }

    /// Stop accepting and close every session
    ///
    /// A second call reports `ListenerClosed`.
    pub fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::ListenerClosed);
        }

        if let Some(task) = self.recv_task.lock().ok().and_then(|mut task| task.take()) {
            task.abort();
        }
        self.closed_notify.notify_waiters();
        self.table.close_all();

        info!("Listener on {} closed", self.transport.local_addr());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Local transport address
    pub fn local_addr(&self) -> IpAddr {
        self.transport.local_addr()
    }

    /// Snapshot of every live connection
    pub fn connections(&self) -> Vec<Connection> {
        self.table.connections()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.table.live_count()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
