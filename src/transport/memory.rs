//! In-memory datagram network
//!
//! Hosts attach to a [`MemoryNetwork`] under an IP address and exchange ICMP
//! bytes through unbounded channels. A [`FaultConfig`] injects deterministic
//! loss and duplication so retransmission paths can be exercised without raw
//! sockets or privileges.

use super::{Datagram, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Deterministic fault model, counted over every packet sent on the network
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Drop every n-th packet
    pub drop_every: Option<u64>,
    /// Deliver every n-th packet twice
    pub duplicate_every: Option<u64>,
}

type Inbox = mpsc::UnboundedSender<(IpAddr, Bytes)>;

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<IpAddr, Inbox>,
    faults: FaultConfig,
    sent: u64,
}

/// A simulated network linking in-process endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create a lossless network
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a network with fault injection
    pub fn with_faults(faults: FaultConfig) -> Self {
        let network = Self::new();
        network.set_faults(faults);
        network
    }

    /// Replace the fault model
    pub fn set_faults(&self, faults: FaultConfig) {
        if let Ok(mut state) = self.state.lock() {
            state.faults = faults;
        }
    }

    /// Attach an endpoint at `addr`, replacing any previous one
    pub fn endpoint(&self, addr: IpAddr) -> MemoryEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.hosts.insert(addr, tx);
        }
        MemoryEndpoint {
            addr,
            network: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn deliver(&self, from: IpAddr, dest: IpAddr, data: Bytes) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| TransportError::Closed)?;
        state.sent += 1;
        let sent = state.sent;

        if matches!(state.faults.drop_every, Some(n) if n > 0 && sent % n == 0) {
            trace!("Dropping packet #{} {} -> {}", sent, from, dest);
            return Ok(());
        }
        let copies = if matches!(state.faults.duplicate_every, Some(n) if n > 0 && sent % n == 0) {
            2
        } else {
            1
        };

        // Like a real network, packets to unknown hosts vanish silently
        if let Some(inbox) = state.hosts.get(&dest) {
            for _ in 0..copies {
                let _ = inbox.send((from, data.clone()));
            }
        }
        Ok(())
    }
}

/// One host's socket on a [`MemoryNetwork`]
pub struct MemoryEndpoint {
    addr: IpAddr,
    network: MemoryNetwork,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(IpAddr, Bytes)>>,
}

#[async_trait]
impl Datagram for MemoryEndpoint {
    async fn send_to(&self, data: &[u8], dest: IpAddr) -> Result<(), TransportError> {
        self.network
            .deliver(self.addr, dest, Bytes::copy_from_slice(data))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, IpAddr), TransportError> {
        let mut rx = self.rx.lock().await;
        let (from, data) = rx.recv().await.ok_or(TransportError::Closed)?;

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> IpAddr {
        self.addr
    }
}
