//! Session table shared by a host's receive loop and its sessions

use super::session::Cleanup;
use super::{Connection, SessionKey, StreamPipe, TunnelError};
use crate::transport::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// A live session as seen by the table
pub(crate) struct Entry {
    /// Delivers inbound messages to the session loop
    pub inbox: mpsc::Sender<Message>,
    /// The session's own pipe, closed to stop it
    pub pipe: Arc<StreamPipe>,
    /// The handle given to the application
    pub connection: Connection,
}

struct Slot {
    generation: u64,
    entry: Entry,
}

impl Slot {
    fn is_live(&self) -> bool {
        !self.entry.inbox.is_closed()
    }
}

/// Result of [`SessionTable::lookup_or_create`]
pub(crate) enum Lookup {
    /// A live session already existed
    Existing(mpsc::Sender<Message>),
    /// A new session was created; its connection should be published
    Created(mpsc::Sender<Message>, Connection),
}

/// Maps session identities to running sessions
#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: RwLock<HashMap<SessionKey, Slot>>,
    next_generation: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand `message` to a live session, or give it back if there is none
    pub fn route(&self, key: &SessionKey, message: Message) -> Result<(), Message> {
        let sessions = self.read();
        let Some(slot) = sessions.get(key) else {
            return Err(message);
        };

        match slot.entry.inbox.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Session {} inbox full, dropping packet", key);
                Ok(())
            }
            Err(TrySendError::Closed(message)) => Err(message),
        }
    }

    /// Return the live session for `key`, creating it with `create` if absent
    ///
    /// `create` runs under the write lock and receives the cleanup callback
    /// that evicts exactly the entry it builds.
    pub fn lookup_or_create<F>(self: &Arc<Self>, key: SessionKey, create: F) -> Result<Lookup, TunnelError>
    where
        F: FnOnce(Cleanup) -> Result<Entry, TunnelError>,
    {
        let mut sessions = self.write();

        if let Some(slot) = sessions.get(&key) {
            if slot.is_live() {
                return Ok(Lookup::Existing(slot.entry.inbox.clone()));
            }
            debug!("Replacing finished session {}", key);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = create(self.cleanup_for(key, generation))?;
        let inbox = entry.inbox.clone();
        let connection = entry.connection.clone();
        sessions.insert(key, Slot { generation, entry });

        Ok(Lookup::Created(inbox, connection))
    }

    /// Check if `key` is in use by any entry, live or not
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.read().contains_key(key)
    }

    /// Remove the entry for `key` if it is still the one from `generation`
    fn remove(&self, key: &SessionKey, generation: u64) {
        let mut sessions = self.write();
        if sessions.get(key).map(|slot| slot.generation) == Some(generation) {
            sessions.remove(key);
            debug!("Session {} removed", key);
        }
    }

    fn cleanup_for(self: &Arc<Self>, key: SessionKey, generation: u64) -> Cleanup {
        let table: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(table) = table.upgrade() {
                table.remove(&key, generation);
            }
        })
    }

    /// Connections of every live session
    pub fn connections(&self) -> Vec<Connection> {
        self.read()
            .values()
            .filter(|slot| slot.is_live())
            .map(|slot| slot.entry.connection.clone())
            .collect()
    }

    /// Number of live sessions
    pub fn live_count(&self) -> usize {
        self.read().values().filter(|slot| slot.is_live()).count()
    }

    /// Close every session; their loops then evict themselves
    pub fn close_all(&self) {
        let pipes: Vec<(SessionKey, Arc<StreamPipe>, Connection)> = self
            .read()
            .iter()
            .map(|(key, slot)| (*key, Arc::clone(&slot.entry.pipe), slot.entry.connection.clone()))
            .collect();

        for (key, pipe, connection) in pipes {
            let _ = connection.close();
            let _ = pipe.close();
            debug!("Closed session {}", key);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionKey, Slot>> {
        self.sessions.read().unwrap_or_else(|poisoned| {
            warn!("Session table lock poisoned");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionKey, Slot>> {
        self.sessions.write().unwrap_or_else(|poisoned| {
            warn!("Session table lock poisoned");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(id: u16) -> SessionKey {
        SessionKey::new("10.0.0.2".parse().unwrap(), id)
    }

    fn entry(key: SessionKey) -> (Entry, mpsc::Receiver<Message>) {
        let (inbox, rx) = mpsc::channel(4);
        let pipe = Arc::new(StreamPipe::new());
        let connection = Connection::new(Arc::clone(&pipe), "10.0.0.1".parse().unwrap(), key);
        (Entry { inbox, pipe, connection }, rx)
    }

    #[test]
    fn test_route_missing_returns_message() {
        let table = SessionTable::new();
        let msg = Message::echo(1, 1, Bytes::new());
        assert_eq!(table.route(&key(1), msg.clone()), Err(msg));
    }

    #[test]
    fn test_create_once_then_route() {
        let table = SessionTable::new();
        let (e, mut rx) = entry(key(1));

        let created = table.lookup_or_create(key(1), |_| Ok(e)).unwrap();
        assert!(matches!(created, Lookup::Created(..)));

        let again = table
            .lookup_or_create(key(1), |_| panic!("must not create twice"))
            .unwrap();
        assert!(matches!(again, Lookup::Existing(_)));

        let msg = Message::echo(1, 2, Bytes::from_static(b"x"));
        assert!(table.route(&key(1), msg.clone()).is_ok());
        assert_eq!(rx.try_recv().unwrap(), msg);
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_finished_session_is_replaced() {
        let table = SessionTable::new();
        let (first, rx) = entry(key(1));
        table.lookup_or_create(key(1), |_| Ok(first)).unwrap();
        drop(rx);

        assert_eq!(table.live_count(), 0);
        let msg = Message::echo(1, 1, Bytes::new());
        assert!(table.route(&key(1), msg).is_err());

        let (second, _rx) = entry(key(1));
        let lookup = table.lookup_or_create(key(1), |_| Ok(second)).unwrap();
        assert!(matches!(lookup, Lookup::Created(..)));
    }

    #[test]
    fn test_stale_cleanup_keeps_newer_entry() {
        let table = SessionTable::new();
        let mut first_cleanup = None;

        let (first, rx) = entry(key(1));
        table
            .lookup_or_create(key(1), |cleanup| {
                first_cleanup = Some(cleanup);
                Ok(first)
            })
            .unwrap();
        drop(rx);

        let (second, _rx) = entry(key(1));
        table.lookup_or_create(key(1), |_| Ok(second)).unwrap();

        // The old session's late callback must not evict the new one
        (first_cleanup.unwrap())();
        assert!(table.contains(&key(1)));
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_cleanup_removes_own_entry() {
        let table = SessionTable::new();
        let mut saved = None;
        let (e, _rx) = entry(key(2));
        table
            .lookup_or_create(key(2), |cleanup| {
                saved = Some(cleanup);
                Ok(e)
            })
            .unwrap();

        (saved.unwrap())();
        assert!(!table.contains(&key(2)));
    }

    #[test]
    fn test_close_all_closes_pipes() {
        let table = SessionTable::new();
        let (a, _ra) = entry(key(1));
        let (b, _rb) = entry(key(2));
        table.lookup_or_create(key(1), |_| Ok(a)).unwrap();
        table.lookup_or_create(key(2), |_| Ok(b)).unwrap();

        let conns = table.connections();
        assert_eq!(conns.len(), 2);

        table.close_all();
        assert!(conns.iter().all(Connection::is_closed));
    }
}
