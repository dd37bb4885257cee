// Jackson Coxson

//! Wire codec for the USB mux protocol: the fixed 28-byte TCP-like packet
//! header and the 20-byte version handshake header. All multi-byte fields
//! are network byte order.

use bytes::{Buf, BufMut, BytesMut};

use crate::DeviceError;

/// Protocol field of TCP-like stream packets.
pub const PROTOCOL_TCP: u32 = 6;
/// Protocol field of version handshake packets.
pub const PROTOCOL_VERSION: u32 = 0;

pub const HEADER_SIZE: usize = 28;
pub const VERSION_HEADER_SIZE: usize = 20;

/// Data offset byte, header length in 32-bit words shifted like TCP's.
pub const DATA_OFFSET: u8 = 0x50;
/// Receive window advertised to the device, in bytes.
pub const WINDOW_SIZE: u16 = 0x0200;

// Lengths are unsigned 32-bit on the wire, but anything at or over 2^31
// is treated as corruption.
const MAX_PACKET_LEN: u32 = i32::MAX as u32;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_ACK: u8 = 0x10;

/// A parsed mux packet header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxHeader {
    pub protocol: u32,
    pub length: u32,
    pub source_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
}

impl MuxHeader {
    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }

    /// Parses and validates a header. The two length fields must agree and
    /// the total must cover at least the header itself.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self, DeviceError> {
        let mut buf = &buf[..];
        let protocol = buf.get_u32();
        let length = buf.get_u32();
        let source_port = buf.get_u16();
        let dest_port = buf.get_u16();
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let _offset = buf.get_u8();
        let flags = buf.get_u8();
        let window = buf.get_u16();
        let _reserved = buf.get_u16();
        let length16 = buf.get_u16();

        if length < HEADER_SIZE as u32 || length >= MAX_PACKET_LEN {
            return Err(DeviceError::MuxError(format!(
                "packet length {length} out of range"
            )));
        }
        if length16 != (length & 0xffff) as u16 {
            return Err(DeviceError::MuxError(format!(
                "length fields disagree: {length} vs {length16}"
            )));
        }

        Ok(Self {
            protocol,
            length,
            source_port,
            dest_port,
            seq,
            ack,
            flags,
            window,
        })
    }
}

/// An outbound mux packet. Header and payload are encoded in one buffer so
/// a single write puts the whole packet on the wire.
#[derive(Debug)]
pub struct MuxPacket<'a> {
    pub source_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl MuxPacket<'_> {
    pub fn encode(&self) -> BytesMut {
        let total = (HEADER_SIZE + self.payload.len()) as u32;
        let mut out = BytesMut::with_capacity(total as usize);
        out.put_u32(PROTOCOL_TCP);
        out.put_u32(total);
        out.put_u16(self.source_port);
        out.put_u16(self.dest_port);
        out.put_u32(self.seq);
        out.put_u32(self.ack);
        out.put_u8(DATA_OFFSET);
        out.put_u8(self.flags);
        out.put_u16(self.window);
        out.put_u16(0);
        out.put_u16((total & 0xffff) as u16);
        out.extend_from_slice(self.payload);
        out
    }
}

/// The handshake header exchanged right after the interface is claimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionHeader {
    pub major: u32,
    pub minor: u32,
}

impl VersionHeader {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn encode(&self) -> [u8; VERSION_HEADER_SIZE] {
        let mut out = [0u8; VERSION_HEADER_SIZE];
        out[0..4].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out[4..8].copy_from_slice(&(VERSION_HEADER_SIZE as u32).to_be_bytes());
        out[8..12].copy_from_slice(&self.major.to_be_bytes());
        out[12..16].copy_from_slice(&self.minor.to_be_bytes());
        out
    }

    pub fn parse(buf: &[u8; VERSION_HEADER_SIZE]) -> Self {
        Self {
            major: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            minor: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let pkt = MuxPacket {
            source_port: 0x1234,
            dest_port: 62078,
            seq: 1000,
            ack: 2000,
            flags: FLAG_ACK,
            window: WINDOW_SIZE,
            payload: b"hello",
        };
        let encoded = pkt.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 5);

        let header = MuxHeader::parse(encoded[..HEADER_SIZE].try_into().unwrap()).unwrap();
        assert_eq!(header.protocol, PROTOCOL_TCP);
        assert_eq!(header.length, (HEADER_SIZE + 5) as u32);
        assert_eq!(header.payload_len(), 5);
        assert_eq!(header.source_port, 0x1234);
        assert_eq!(header.dest_port, 62078);
        assert_eq!(header.seq, 1000);
        assert_eq!(header.ack, 2000);
        assert_eq!(header.flags, FLAG_ACK);
        assert_eq!(header.window, WINDOW_SIZE);
        assert_eq!(&encoded[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn fields_are_network_byte_order() {
        let pkt = MuxPacket {
            source_port: 0x1234,
            dest_port: 0xf27e,
            seq: 0,
            ack: 0,
            flags: FLAG_SYN,
            window: 0x0200,
            payload: &[],
        };
        let encoded = pkt.encode();
        assert_eq!(&encoded[0..4], &[0, 0, 0, 6]);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 28]);
        assert_eq!(&encoded[8..10], &[0x12, 0x34]);
        assert_eq!(&encoded[10..12], &[0xf2, 0x7e]);
        assert_eq!(encoded[20], DATA_OFFSET);
        assert_eq!(encoded[21], FLAG_SYN);
        assert_eq!(&encoded[22..24], &[0x02, 0x00]);
        assert_eq!(&encoded[26..28], &[0, 28]);
    }

    #[test]
    fn rejects_short_length() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&PROTOCOL_TCP.to_be_bytes());
        raw[4..8].copy_from_slice(&27u32.to_be_bytes());
        raw[26..28].copy_from_slice(&27u16.to_be_bytes());
        assert!(matches!(
            MuxHeader::parse(&raw),
            Err(DeviceError::MuxError(_))
        ));
    }

    #[test]
    fn rejects_oversized_length() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&PROTOCOL_TCP.to_be_bytes());
        let length = 1u32 << 31;
        raw[4..8].copy_from_slice(&length.to_be_bytes());
        raw[26..28].copy_from_slice(&((length & 0xffff) as u16).to_be_bytes());
        assert!(matches!(
            MuxHeader::parse(&raw),
            Err(DeviceError::MuxError(_))
        ));
    }

    #[test]
    fn rejects_disagreeing_lengths() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&PROTOCOL_TCP.to_be_bytes());
        raw[4..8].copy_from_slice(&64u32.to_be_bytes());
        raw[26..28].copy_from_slice(&28u16.to_be_bytes());
        assert!(matches!(
            MuxHeader::parse(&raw),
            Err(DeviceError::MuxError(_))
        ));
    }

    #[test]
    fn version_header_layout() {
        let encoded = VersionHeader::CURRENT.encode();
        assert_eq!(&encoded[0..4], &[0, 0, 0, 0]);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 20]);
        assert_eq!(&encoded[8..12], &[0, 0, 0, 1]);
        assert_eq!(&encoded[12..20], &[0; 8]);
        assert_eq!(VersionHeader::parse(&encoded), VersionHeader::CURRENT);
    }
}
