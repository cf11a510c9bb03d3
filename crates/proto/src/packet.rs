//! Wire format: a fixed 12-byte big-endian header followed by the payload.
//!
//! ```text
//! [payload_length:4][kind:1][sequence:2][checksum:4][last_fragment:1] payload...
//! ```
//!
//! The checksum is the first four bytes of the md5 digest of the payload.
//! No I/O happens here; framing over a live stream lives in [`crate::transport`].

pub const HEADER_LEN: usize = 12;
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;
pub const DEFAULT_PORT: u16 = 5000;

const OFF_LEN: usize = 0;
const OFF_KIND: usize = 4;
const OFF_SEQ: usize = 5;
const OFF_CHECKSUM: usize = 7;
const OFF_LAST: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Syn,
    Ack,
    HandshakeAck,
    Data,
    Nack,
    Disconnect,
    SetNick,
    ListRequest,
    ListResponse,
    ChannelConfig,
}

impl PacketKind {
    pub fn as_byte(self) -> u8 {
        match self {
            PacketKind::Syn => 0x01,
            PacketKind::Ack => 0x02,
            PacketKind::HandshakeAck => 0x03,
            PacketKind::Data => 0x04,
            PacketKind::Nack => 0x05,
            PacketKind::Disconnect => 0x06,
            PacketKind::SetNick => 0x07,
            PacketKind::ListRequest => 0x08,
            PacketKind::ListResponse => 0x09,
            PacketKind::ChannelConfig => 99,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(PacketKind::Syn),
            0x02 => Some(PacketKind::Ack),
            0x03 => Some(PacketKind::HandshakeAck),
            0x04 => Some(PacketKind::Data),
            0x05 => Some(PacketKind::Nack),
            0x06 => Some(PacketKind::Disconnect),
            0x07 => Some(PacketKind::SetNick),
            0x08 => Some(PacketKind::ListRequest),
            0x09 => Some(PacketKind::ListResponse),
            99 => Some(PacketKind::ChannelConfig),
            _ => None,
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::Syn => "SYN",
            PacketKind::Ack => "ACK",
            PacketKind::HandshakeAck => "HANDSHAKE_ACK",
            PacketKind::Data => "DATA",
            PacketKind::Nack => "NACK",
            PacketKind::Disconnect => "DISCONNECT",
            PacketKind::SetNick => "SET_NICK",
            PacketKind::ListRequest => "LIST_REQUEST",
            PacketKind::ListResponse => "LIST_RESPONSE",
            PacketKind::ChannelConfig => "CHANNEL_CONFIG",
        };
        f.write_str(name)
    }
}

/// First four bytes of the md5 digest of `payload`.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = md5::compute(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Parsed header fields, in host order.
///
/// `checksum` is the value declared by the sender; callers that run the
/// payload through the channel simulator verify it themselves via
/// [`Header::verify`] instead of relying on [`Packet::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_length: u32,
    pub kind: PacketKind,
    pub sequence: u16,
    pub checksum: [u8; 4],
    pub last_fragment: bool,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self, MalformedPacket> {
        if buf.len() < HEADER_LEN {
            return Err(MalformedPacket::BufferTooShort);
        }
        let payload_length = u32::from_be_bytes(buf[OFF_LEN..OFF_LEN + 4].try_into().unwrap());
        let kind = PacketKind::from_byte(buf[OFF_KIND])
            .ok_or(MalformedPacket::UnknownKind(buf[OFF_KIND]))?;
        let sequence = u16::from_be_bytes(buf[OFF_SEQ..OFF_SEQ + 2].try_into().unwrap());
        let checksum = buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].try_into().unwrap();
        let last_fragment = buf[OFF_LAST] != 0;
        Ok(Self {
            payload_length,
            kind,
            sequence,
            checksum,
            last_fragment,
        })
    }

    /// `true` when `payload` hashes to the declared checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        checksum(payload) == self.checksum
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub sequence: u16,
    pub last_fragment: bool,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind, sequence: u16, last_fragment: bool, payload: Vec<u8>) -> Self {
        Self {
            kind,
            sequence,
            last_fragment,
            payload,
        }
    }

    /// A control packet with sequence 0 and no fragment flag.
    pub fn control(kind: PacketKind, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(kind, 0, false, payload.into())
    }

    pub fn data(sequence: u16, last_fragment: bool, payload: Vec<u8>) -> Self {
        Self::new(PacketKind::Data, sequence, last_fragment, payload)
    }

    pub fn ack(sequence: u16) -> Self {
        let text = format!("ACK for seq {sequence}");
        Self::new(PacketKind::Ack, sequence, false, text.into_bytes())
    }

    pub fn nack(sequence: u16) -> Self {
        let text = format!("NACK for seq {sequence}");
        Self::new(PacketKind::Nack, sequence, false, text.into_bytes())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[OFF_LEN..OFF_LEN + 4].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf[OFF_KIND] = self.kind.as_byte();
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.sequence.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum(&self.payload));
        buf[OFF_LAST] = u8::from(self.last_fragment);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse and fully verify a packet from a raw buffer.
    ///
    /// Fails when the buffer cannot hold a header, the declared length
    /// exceeds the available bytes, the kind byte is unknown, or the
    /// recomputed checksum mismatches. A failure here means the bytes were
    /// corrupted somewhere, not that the transport broke.
    pub fn decode(buf: &[u8]) -> Result<Self, MalformedPacket> {
        let header = Header::parse(buf)?;
        let declared = header.payload_length as usize;
        let available = buf.len() - HEADER_LEN;
        if declared > available {
            return Err(MalformedPacket::LengthMismatch {
                declared,
                available,
            });
        }
        let payload = buf[HEADER_LEN..HEADER_LEN + declared].to_vec();
        if !header.verify(&payload) {
            return Err(MalformedPacket::ChecksumFailed(header.sequence));
        }
        Ok(Self {
            kind: header.kind,
            sequence: header.sequence,
            last_fragment: header.last_fragment,
            payload,
        })
    }

    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("declared payload length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },
    #[error("declared payload length {0} exceeds the maximum packet size")]
    PayloadTooLarge(usize),
    #[error("unknown packet type {0:#04x}")]
    UnknownKind(u8),
    #[error("checksum verification failed for sequence {0}")]
    ChecksumFailed(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_all_fields() {
        let packet = Packet::data(7, true, b"hello".to_vec());
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.kind, PacketKind::Data);
        assert_eq!(decoded.sequence, 7);
        assert!(decoded.last_fragment);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn roundtrip_empty_payload() {
        let packet = Packet::control(PacketKind::Disconnect, "");
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.kind, PacketKind::Disconnect);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn header_layout_is_big_endian() {
        let packet = Packet::new(PacketKind::Data, 0x0102, false, vec![0xAA; 3]);
        let bytes = packet.encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 3]);
        assert_eq!(bytes[4], 0x04);
        assert_eq!(&bytes[5..7], &[0x01, 0x02]);
        assert_eq!(bytes[11], 0);
        assert_eq!(bytes.len(), HEADER_LEN + 3);
    }

    #[test]
    fn corrupted_payload_byte_fails_checksum() {
        let packet = Packet::data(3, false, b"payload".to_vec());
        let encoded = packet.encode();
        for i in HEADER_LEN..encoded.len() {
            let mut bytes = encoded.clone();
            bytes[i] = bytes[i].wrapping_add(1);
            assert_eq!(
                Packet::decode(&bytes),
                Err(MalformedPacket::ChecksumFailed(3)),
                "mutation at byte {i} went undetected"
            );
        }
    }

    #[test]
    fn corrupted_checksum_field_fails() {
        let mut bytes = Packet::data(0, false, b"xyz".to_vec()).encode();
        bytes[OFF_CHECKSUM] ^= 0xFF;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(MalformedPacket::ChecksumFailed(0))
        ));
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert_eq!(Packet::decode(&[]), Err(MalformedPacket::BufferTooShort));
        assert_eq!(
            Packet::decode(&[0u8; HEADER_LEN - 1]),
            Err(MalformedPacket::BufferTooShort)
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = Packet::data(0, false, b"data".to_vec()).encode();
        bytes.pop();
        assert_eq!(
            Packet::decode(&bytes),
            Err(MalformedPacket::LengthMismatch {
                declared: 4,
                available: 3
            })
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = Packet::data(0, false, b"x".to_vec()).encode();
        bytes[OFF_KIND] = 0x42;
        assert_eq!(Packet::decode(&bytes), Err(MalformedPacket::UnknownKind(0x42)));
    }

    #[test]
    fn kind_bytes_match_wire_codes() {
        assert_eq!(PacketKind::Syn.as_byte(), 0x01);
        assert_eq!(PacketKind::ChannelConfig.as_byte(), 99);
        for byte in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 99] {
            assert_eq!(PacketKind::from_byte(byte).unwrap().as_byte(), byte);
        }
        assert!(PacketKind::from_byte(0x0A).is_none());
    }
}
