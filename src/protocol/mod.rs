//! Protocol definitions and constants

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Packet too short: {0} bytes")]
    Truncated(usize),

    #[error("Bad checksum: expected {expected:#06x}, got {actual:#06x}")]
    BadChecksum { expected: u16, actual: u16 },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Invalid message code: {0}")]
    InvalidMessageCode(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Record too large: {0} bytes")]
    RecordTooLarge(usize),
}

/// ICMPv4 type for Echo Request
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// ICMPv4 type for Echo Reply
pub const ICMP_ECHO_REPLY: u8 = 0;

/// ICMP header size (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_SIZE: usize = 8;

/// Maximum tunnel payload carried by one packet
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Receive buffer size for the raw socket (IPv4 header + ICMP + payload)
pub const RECV_BUFFER_SIZE: usize = 32768;

/// Time the initiator waits for a matching reply before resending
///
/// Kept below [`RECORD_TIMEOUT`] so a lost packet inside a sealed record is
/// retransmitted before the record deadline expires.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(1);

/// Time without any Echo after which a responder session ends
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before an empty reply when neither side has data
pub const IDLE_REPLY_DELAY: Duration = Duration::from_millis(300);

/// Pending inbound messages per session
pub const INBOX_CAPACITY: usize = 100;

/// Pending unaccepted connections per listener
pub const ACCEPT_BACKLOG: usize = 100;

/// Largest sealed record the secure channel accepts
pub const MAX_RECORD_SIZE: usize = 32768;

/// Secure record length prefix size
pub const RECORD_HEADER_SIZE: usize = 4;

/// Deadline for reading one sealed record body
pub const RECORD_TIMEOUT: Duration = Duration::from_secs(2);
