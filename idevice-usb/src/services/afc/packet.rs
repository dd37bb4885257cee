// Jackson Coxson

use log::debug;

use crate::{DeviceConnection, DeviceError};

use super::opcode::AfcOpcode;

/// The fixed AFC header. All fields are 64-bit little-endian.
#[derive(Clone, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    /// Header + header payload + payload.
    pub entire_len: u64,
    /// Header + header payload.
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN as usize);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.entire_len.to_le_bytes());
        out.extend_from_slice(&self.header_payload_len.to_le_bytes());
        out.extend_from_slice(&self.packet_num.to_le_bytes());
        out.extend_from_slice(&(self.operation as u64).to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DeviceError> {
        if bytes.len() < Self::LEN as usize {
            return Err(DeviceError::NotEnoughData);
        }
        let mut fields = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()));
        let magic = fields.next().unwrap();
        let entire_len = fields.next().unwrap();
        let header_payload_len = fields.next().unwrap();
        let packet_num = fields.next().unwrap();
        let operation = fields.next().unwrap();

        if magic != super::MAGIC {
            return Err(DeviceError::MuxError(format!(
                "bad afc magic {magic:#018x}"
            )));
        }
        if header_payload_len < Self::LEN || entire_len < header_payload_len {
            return Err(DeviceError::MuxError(
                "afc length fields disagree".to_string(),
            ));
        }
        let operation = AfcOpcode::try_from(operation)
            .map_err(|op| DeviceError::Unknown(format!("unknown afc opcode {op:#x}")))?;

        Ok(Self {
            magic,
            entire_len,
            header_payload_len,
            packet_num,
            operation,
        })
    }

    pub async fn read(connection: &mut DeviceConnection) -> Result<Self, DeviceError> {
        let bytes = connection.read_raw(Self::LEN as usize).await?;
        Self::parse(&bytes)
    }
}

impl AfcPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header.serialize();
        out.extend_from_slice(&self.header_payload);
        out.extend_from_slice(&self.payload);
        out
    }

    pub async fn read(connection: &mut DeviceConnection) -> Result<Self, DeviceError> {
        let header = AfcPacketHeader::read(connection).await?;
        debug!("afc header: {header:?}");
        let header_payload = connection
            .read_raw((header.header_payload_len - AfcPacketHeader::LEN) as usize)
            .await?;
        let payload = if header.entire_len == header.header_payload_len {
            Vec::new()
        } else {
            connection
                .read_raw((header.entire_len - header.header_payload_len) as usize)
                .await?
        };
        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = AfcPacketHeader {
            magic: super::super::MAGIC,
            entire_len: 52,
            header_payload_len: 44,
            packet_num: 3,
            operation: AfcOpcode::GetDevInfo,
        };
        let bytes = header.serialize();
        assert_eq!(bytes.len(), AfcPacketHeader::LEN as usize);
        assert_eq!(&bytes[0..8], b"CFA6LPAA");

        let parsed = AfcPacketHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.entire_len, 52);
        assert_eq!(parsed.header_payload_len, 44);
        assert_eq!(parsed.packet_num, 3);
        assert_eq!(parsed.operation, AfcOpcode::GetDevInfo);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let header = AfcPacketHeader {
            magic: 0x1122334455667788,
            entire_len: 40,
            header_payload_len: 40,
            packet_num: 0,
            operation: AfcOpcode::Status,
        };
        assert!(AfcPacketHeader::parse(&header.serialize()).is_err());
    }

    #[test]
    fn inconsistent_lengths_are_rejected() {
        let header = AfcPacketHeader {
            magic: super::super::MAGIC,
            entire_len: 40,
            header_payload_len: 60,
            packet_num: 0,
            operation: AfcOpcode::Status,
        };
        assert!(AfcPacketHeader::parse(&header.serialize()).is_err());
    }
}
