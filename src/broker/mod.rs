//! Line-based broadcast relay
//!
//! Every newline-terminated message read from any connection is written to
//! every connection currently attached to the broker, the sender included.
//! Lines are opaque bytes. A connection is closed once its reader stops.

use crate::tunnel::{Connection, Listener, SessionKey, TunnelError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// Relays chat lines between tunnel connections
#[derive(Default)]
pub struct Broker {
    pool: RwLock<HashMap<SessionKey, Connection>>,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept connections until the listener closes
    pub async fn serve(self: &Arc<Self>, listener: &Listener) -> Result<(), TunnelError> {
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(TunnelError::ListenerClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            let key = conn.session_key();
            info!("Connected: {}", key);
            self.store(key, conn.clone());

            let broker = Arc::clone(self);
            tokio::spawn(async move {
                broker.serve_connection(conn).await;
                broker.remove(&key);
                info!("Disconnected: {}", key);
            });
        }
    }

    /// Relay lines from `conn` until it ends, then close it
    async fn serve_connection(&self, conn: Connection) {
        let key = conn.session_key();
        let mut reader = BufReader::new(conn.clone());
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) if line.last() != Some(&b'\n') => {
                    debug!("{} closed mid-line, dropping {} bytes", key, line.len());
                    break;
                }
                Ok(_) => {
                    debug!("{} >> {}", key, String::from_utf8_lossy(&line).trim_end());
                    self.broadcast(&line);
                }
                Err(e) => {
                    debug!("Read from {} failed: {}", key, e);
                    break;
                }
            }
        }

        let _ = conn.close();
    }

    /// Send `line` to every attached connection, newline-terminated
    ///
    /// Bytes are relayed as they are; nothing assumes UTF-8.
    pub fn broadcast(&self, line: &[u8]) {
        let mut message = Vec::with_capacity(line.len() + 1);
        message.extend_from_slice(line);
        if message.last() != Some(&b'\n') {
            message.push(b'\n');
        }

        for conn in self.connections() {
            if conn.write(&message).is_err() {
                debug!("Dropping message for closed connection {}", conn.session_key());
            }
        }
    }

    /// Attached connections
    pub fn connections(&self) -> Vec<Connection> {
        match self.pool.read() {
            Ok(pool) => pool.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    fn store(&self, key: SessionKey, conn: Connection) {
        if let Ok(mut pool) = self.pool.write() {
            pool.insert(key, conn);
        }
    }

    fn remove(&self, key: &SessionKey) {
        if let Ok(mut pool) = self.pool.write() {
            pool.remove(key);
        }
    }
}
