// Jackson Coxson

/// AFC operation codes, from the protocol's 64-bit opcode field. Only the
/// operations the client issues (and the replies they produce) are listed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    GetDevInfo = 0x0b,
    RenamePath = 0x18,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, u64> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0a => Self::GetFileInfo,
            0x0b => Self::GetDevInfo,
            0x18 => Self::RenamePath,
            other => return Err(other),
        })
    }
}
