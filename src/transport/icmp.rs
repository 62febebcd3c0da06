//! ICMPv4 Echo / Echo Reply encoding
//!
//! Message format (RFC 792):
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  |  Code  |     Checksum    |
//! +--------+--------+--------+--------+
//! |   Identifier    |    Sequence     |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use crate::protocol::{
    ProtocolError, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Direction of an Echo exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Echo Request, initiator to responder
    Echo,
    /// Echo Reply, responder to initiator
    EchoReply,
}

impl MessageKind {
    fn icmp_type(self) -> u8 {
        match self {
            MessageKind::Echo => ICMP_ECHO_REQUEST,
            MessageKind::EchoReply => ICMP_ECHO_REPLY,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            ICMP_ECHO_REQUEST => Ok(MessageKind::Echo),
            ICMP_ECHO_REPLY => Ok(MessageKind::EchoReply),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// One tunnel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Echo or Echo Reply
    pub kind: MessageKind,
    /// Session identifier
    pub id: u16,
    /// Protocol sequence number
    pub seq: u16,
    /// Tunnel bytes carried by this packet
    pub payload: Bytes,
}

impl Message {
    /// Create an Echo Request
    pub fn echo(id: u16, seq: u16, payload: Bytes) -> Self {
        Self {
            kind: MessageKind::Echo,
            id,
            seq,
            payload,
        }
    }

    /// Create the Echo Reply answering this message
    pub fn reply(&self, payload: Bytes) -> Self {
        Self {
            kind: MessageKind::EchoReply,
            id: self.id,
            seq: self.seq,
            payload,
        }
    }

    /// Encode to wire bytes with a valid checksum
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ICMP_HEADER_SIZE + self.payload.len());

        buf.put_u8(self.kind.icmp_type());
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u16(self.id);
        buf.put_u16(self.seq);
        buf.extend_from_slice(&self.payload);

        let sum = checksum(&buf);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());

        buf
    }

    /// Decode from wire bytes (no IP header)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < ICMP_HEADER_SIZE {
            return Err(ProtocolError::Truncated(buf.len()));
        }

        let kind = MessageKind::try_from(buf[0])?;
        if buf[1] != 0 {
            return Err(ProtocolError::InvalidMessageCode(buf[1]));
        }

        let payload_len = buf.len() - ICMP_HEADER_SIZE;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }

        // A correct checksum makes the one's complement sum over the whole
        // message come out as zero.
        if checksum(buf) != 0 {
            let actual = u16::from_be_bytes([buf[2], buf[3]]);
            let mut zeroed = buf.to_vec();
            zeroed[2] = 0;
            zeroed[3] = 0;
            return Err(ProtocolError::BadChecksum {
                expected: checksum(&zeroed),
                actual,
            });
        }

        Ok(Self {
            kind,
            id: u16::from_be_bytes([buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
            payload: Bytes::copy_from_slice(&buf[ICMP_HEADER_SIZE..]),
        })
    }
}

/// Internet checksum (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;

    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_encode_decode() {
        let original = Message::echo(0x1234, 7, Bytes::from_static(b"hello"));
        let encoded = original.encode();

        assert_eq!(encoded.len(), ICMP_HEADER_SIZE + 5);
        assert_eq!(encoded[0], ICMP_ECHO_REQUEST);
        assert_eq!(&encoded[4..6], &[0x12, 0x34]);

        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_reply_keeps_id_and_seq() {
        let echo = Message::echo(9, 42, Bytes::new());
        let reply = echo.reply(Bytes::from_static(b"data"));

        assert_eq!(reply.kind, MessageKind::EchoReply);
        assert_eq!(reply.id, 9);
        assert_eq!(reply.seq, 42);

        let decoded = Message::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::EchoReply);
        assert_eq!(&decoded.payload[..], b"data");
    }

    #[test]
    fn test_known_checksum() {
        // Echo request, id 1, seq 1, no payload: 08 00 f7 fd 00 01 00 01
        let encoded = Message::echo(1, 1, Bytes::new()).encode();
        assert_eq!(&encoded[..], &[0x08, 0x00, 0xf7, 0xfd, 0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_odd_length_payload() {
        let msg = Message::echo(3, 4, Bytes::from_static(b"abc"));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(&decoded.payload[..], b"abc");
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let mut encoded = Message::echo(1, 2, Bytes::from_static(b"xyz")).encode();
        encoded[8] ^= 0x01;

        assert!(matches!(
            Message::decode(&encoded),
            Err(ProtocolError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_other_icmp_types_rejected() {
        // Destination unreachable
        let mut packet = vec![3u8, 1, 0, 0, 0, 0, 0, 0];
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());

        assert!(matches!(
            Message::decode(&packet),
            Err(ProtocolError::InvalidMessageType(3))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(matches!(
            Message::decode(&[8, 0, 0]),
            Err(ProtocolError::Truncated(3))
        ));
    }
}
