// Jackson Coxson

use thiserror::Error;

use crate::DeviceError;

/// Status codes AFC returns in the first eight bytes of a Status packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[repr(u64)]
pub enum AfcError {
    #[error("unknown afc error")]
    UnknownError = 1,
    #[error("op header invalid")]
    OpHeaderInvalid = 2,
    #[error("no resources")]
    NoResources = 3,
    #[error("read error")]
    ReadError = 4,
    #[error("write error")]
    WriteError = 5,
    #[error("unknown packet type")]
    UnknownPacketType = 6,
    #[error("invalid argument")]
    InvalidArg = 7,
    #[error("object not found")]
    ObjectNotFound = 8,
    #[error("object is a directory")]
    ObjectIsDir = 9,
    #[error("permission denied")]
    PermDenied = 10,
    #[error("service not connected")]
    ServiceNotConnected = 11,
    #[error("operation timed out")]
    OpTimeout = 12,
    #[error("too much data")]
    TooMuchData = 13,
    #[error("end of data")]
    EndOfData = 14,
    #[error("operation not supported")]
    OpNotSupported = 15,
    #[error("object exists")]
    ObjectExists = 16,
    #[error("object busy")]
    ObjectBusy = 17,
    #[error("no space left")]
    NoSpaceLeft = 18,
    #[error("operation would block")]
    OpWouldBlock = 19,
    #[error("io error")]
    IoError = 20,
    #[error("operation interrupted")]
    OpInterrupted = 21,
    #[error("operation in progress")]
    OpInProgress = 22,
    #[error("internal error")]
    InternalError = 23,
}

impl AfcError {
    /// Interprets a status code; 0 is success.
    pub fn from_code(code: u64) -> Result<(), Self> {
        Err(match code {
            0 => return Ok(()),
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            _ => Self::UnknownError,
        })
    }
}

impl From<AfcError> for DeviceError {
    fn from(e: AfcError) -> Self {
        DeviceError::Unknown(format!("afc: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_success() {
        assert!(AfcError::from_code(0).is_ok());
    }

    #[test]
    fn known_codes_map() {
        assert_eq!(AfcError::from_code(8), Err(AfcError::ObjectNotFound));
        assert_eq!(AfcError::from_code(10), Err(AfcError::PermDenied));
        assert_eq!(AfcError::from_code(999), Err(AfcError::UnknownError));
    }
}
