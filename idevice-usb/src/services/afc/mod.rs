// Jackson Coxson

//! AFC (Apple File Conduit) client. The service speaks its own framing on
//! top of the mux connection: a 40-byte little-endian header with the
//! `CFA6LPAA` magic, an opcode and a running packet number.

pub mod errors;
pub mod opcode;
pub mod packet;

use std::collections::HashMap;

use log::warn;

use crate::{DeviceConnection, DeviceError};
use errors::AfcError;
use opcode::AfcOpcode;
use packet::{AfcPacket, AfcPacketHeader};

/// `CFA6LPAA` in little-endian byte order.
pub const MAGIC: u64 = 0x4141504c36414643;

/// Client for the file conduit service.
pub struct AfcClient {
    pub connection: DeviceConnection,
    packet_num: u64,
}

/// Filesystem facts AFC reports for the whole device.
#[derive(Clone, Debug)]
pub struct AfcDeviceInfo {
    pub model: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub block_size: u64,
}

impl super::ServiceClient for AfcClient {
    fn service_name() -> &'static str {
        "com.apple.afc"
    }

    fn from_connection(connection: DeviceConnection) -> Self {
        Self::new(connection)
    }
}

impl AfcClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            packet_num: 0,
        }
    }

    /// Sends one AFC packet, stamping the running packet number.
    pub async fn send(&mut self, operation: AfcOpcode, header_payload: Vec<u8>, payload: Vec<u8>)
        -> Result<(), DeviceError>
    {
        let header_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        let packet = AfcPacket {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: header_len + payload.len() as u64,
                header_payload_len: header_len,
                packet_num: self.packet_num,
                operation,
            },
            header_payload,
            payload,
        };
        self.packet_num += 1;
        self.connection.send_raw(&packet.serialize()).await
    }

    /// Reads one AFC packet, surfacing a Status payload as its error code.
    pub async fn read(&mut self) -> Result<AfcPacket, DeviceError> {
        let packet = AfcPacket::read(&mut self.connection).await?;
        if packet.header.operation == AfcOpcode::Status {
            if let Some(code) = packet
                .header_payload
                .get(..8)
                .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
            {
                if let Err(e) = AfcError::from_code(code) {
                    return Err(e.into());
                }
            }
        }
        Ok(packet)
    }

    async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
    ) -> Result<AfcPacket, DeviceError> {
        self.send(operation, header_payload, Vec::new()).await?;
        self.read().await
    }

    /// Fetches the device-wide filesystem info.
    pub async fn get_device_info(&mut self) -> Result<AfcDeviceInfo, DeviceError> {
        let res = self.request(AfcOpcode::GetDevInfo, Vec::new()).await?;
        let kv = parse_key_values(&res.payload);
        let take = |key: &str| -> Result<String, DeviceError> {
            kv.get(key).cloned().ok_or_else(|| {
                warn!("device info response missing {key}");
                DeviceError::Unknown(format!("device info response missing {key}"))
            })
        };
        Ok(AfcDeviceInfo {
            model: take("Model")?,
            total_bytes: take("FSTotalBytes")?.parse().unwrap_or(0),
            free_bytes: take("FSFreeBytes")?.parse().unwrap_or(0),
            block_size: take("FSBlockSize")?.parse().unwrap_or(0),
        })
    }

    /// Lists the entries of a directory on the device.
    pub async fn list_dir(&mut self, path: impl Into<String>) -> Result<Vec<String>, DeviceError> {
        let path = path.into();
        let res = self
            .request(AfcOpcode::ReadDir, null_terminated(&path))
            .await?;
        Ok(split_strings(&res.payload)
            .into_iter()
            .filter(|entry| entry != "." && entry != "..")
            .collect())
    }

    /// Key/value metadata for one path.
    pub async fn get_file_info(
        &mut self,
        path: impl Into<String>,
    ) -> Result<HashMap<String, String>, DeviceError> {
        let path = path.into();
        let res = self
            .request(AfcOpcode::GetFileInfo, null_terminated(&path))
            .await?;
        Ok(parse_key_values(&res.payload))
    }

    pub async fn make_dir(&mut self, path: impl Into<String>) -> Result<(), DeviceError> {
        let path = path.into();
        self.request(AfcOpcode::MakeDir, null_terminated(&path))
            .await?;
        Ok(())
    }

    pub async fn remove_path(&mut self, path: impl Into<String>) -> Result<(), DeviceError> {
        let path = path.into();
        self.request(AfcOpcode::RemovePath, null_terminated(&path))
            .await?;
        Ok(())
    }

    pub async fn rename_path(
        &mut self,
        source: impl Into<String>,
        dest: impl Into<String>,
    ) -> Result<(), DeviceError> {
        let mut header_payload = null_terminated(&source.into());
        header_payload.extend_from_slice(&null_terminated(&dest.into()));
        self.request(AfcOpcode::RenamePath, header_payload).await?;
        Ok(())
    }
}

fn null_terminated(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

fn split_strings(payload: &[u8]) -> Vec<String> {
    payload
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).to_string())
        .collect()
}

/// AFC returns tables as a flat null-separated key, value, key, value list.
fn parse_key_values(payload: &[u8]) -> HashMap<String, String> {
    let strings = split_strings(payload);
    strings
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}
