//! Encrypted record channel over a tunnel connection
//!
//! Record framing on the wrapped connection:
//! ```text
//! +-------------------+----------------+----------------------+-----------+
//! |  Length (4B, BE)  |  Nonce (12B)   |  Ciphertext          | Tag (16B) |
//! +-------------------+----------------+----------------------+-----------+
//! ```
//! The length covers nonce, ciphertext and tag.

use super::{Connection, StreamPipe, TunnelError};
use crate::config::TunnelConfig;
use crate::crypto::{Cipher, RECORD_OVERHEAD};
use crate::protocol::{ProtocolError, RECORD_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

/// Decorates a connection with AES-GCM sealed records
pub struct SecureChannel;

impl SecureChannel {
    /// Wrap `base`, returning the plaintext connection
    ///
    /// Two tasks move records between the connections. Any record failure,
    /// or closing either side, closes both.
    pub fn wrap(base: Connection, cipher: Arc<Cipher>, config: &TunnelConfig) -> Connection {
        let plain = Arc::new(StreamPipe::new());
        let conn = Connection::new(Arc::clone(&plain), base.local_addr(), base.session_key());

        let record_limit = config.record_limit;
        let record_timeout = config.record_timeout();
        let max_chunk = record_chunk(config);

        tokio::spawn(read_loop(
            base.clone(),
            Arc::clone(&plain),
            Arc::clone(&cipher),
            record_limit,
            record_timeout,
        ));
        tokio::spawn(write_loop(base, plain, cipher, max_chunk));

        conn
    }
}

/// Largest plaintext sealed into one record
///
/// A framed record fits in one packet payload, so its body spans at most
/// two packets.
fn record_chunk(config: &TunnelConfig) -> usize {
    let per_packet = config.max_payload.saturating_sub(RECORD_HEADER_SIZE);
    config
        .record_limit
        .min(per_packet)
        .saturating_sub(RECORD_OVERHEAD)
        .max(1)
}

/// Turn records from the wrapped connection into plaintext
async fn read_loop(
    mut base: Connection,
    plain: Arc<StreamPipe>,
    cipher: Arc<Cipher>,
    record_limit: usize,
    record_timeout: Duration,
) {
    let key = base.session_key();

    let result: Result<(), TunnelError> = async {
        loop {
            let mut len_buf = [0u8; RECORD_HEADER_SIZE];
            base.read_exact(&mut len_buf).await?;
            let record_len = u32::from_be_bytes(len_buf) as usize;

            if record_len > record_limit {
                return Err(ProtocolError::RecordTooLarge(record_len).into());
            }

            let mut record = vec![0u8; record_len];
            tokio::time::timeout(record_timeout, base.read_exact(&mut record))
                .await
                .map_err(|_| TunnelError::RecordTimeout)??;

            let plaintext = cipher.open(&record)?;
            trace!("Secure channel {}: received {} bytes", key, plaintext.len());
            plain.push_inbound(Bytes::from(plaintext))?;
        }
    }
    .await;

    if let Err(e) = result {
        debug!("Secure channel {} read side ended: {}", key, e);
    }
    let _ = plain.close();
    let _ = base.close();
}

/// Seal plaintext writes into records on the wrapped connection
async fn write_loop(base: Connection, plain: Arc<StreamPipe>, cipher: Arc<Cipher>, max_chunk: usize) {
    let key = base.session_key();

    let result: Result<(), TunnelError> = async {
        loop {
            plain.wait_outbound().await;
            let chunk = plain.drain_outbound(max_chunk)?;
            if chunk.is_empty() {
                continue;
            }

            let record = cipher.seal(&chunk)?;
            let mut framed = BytesMut::with_capacity(RECORD_HEADER_SIZE + record.len());
            framed.put_u32(record.len() as u32);
            framed.extend_from_slice(&record);

            // One write keeps header and record contiguous in the stream
            base.write(&framed)?;
            trace!("Secure channel {}: sent {} bytes", key, chunk.len());
        }
    }
    .await;

    if let Err(e) = result {
        debug!("Secure channel {} write side ended: {}", key, e);
    }
    let _ = plain.close();
    let _ = base.close();
}
