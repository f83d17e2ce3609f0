// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for the command queue and management channel

use core::fmt;

/// Result type used throughout the crate
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free ring slots; the caller should back off and retry
    QueueFull,
    /// The requested run of slots would cross the top of the ring
    WouldWrap,
    /// Device was surprise-removed or the PCIe link is down
    DeviceAbsent,
    /// Management channel is busy (firmware activation); poll and retry
    ChannelBusy,
    /// Request was lost: no completion arrived and hardware still owns it
    Timeout,
    /// Sequence or message id mismatch
    ProtocolMismatch,
    /// Request reached the device and the device reported a failure
    DeviceStatus(DeviceStatus),
    /// Invalid parameter
    InvalidParameter,
    /// Payload exceeds what a single request can carry
    MessageTooLarge,
    /// Response does not fit into the caller's buffer
    ResponseTooLarge { len: usize, capacity: usize },
    /// API command chain failure
    ApiChain(ApiChainError),
    /// DMA allocation failed
    NoMemory,
    /// Component used before initialization finished
    NotInitialized,
}

impl Error {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull | Error::WouldWrap | Error::ChannelBusy)
    }

    /// Stable numeric code, as reported to upper layers
    pub fn code(&self) -> i32 {
        match self {
            Error::QueueFull | Error::WouldWrap => -16,
            Error::DeviceAbsent => -1,
            Error::ChannelBusy => DeviceStatus::BUSY_ACTIVE_FW.0 as i32,
            Error::Timeout => -110,
            Error::ProtocolMismatch => -71,
            Error::DeviceStatus(status) => status.0 as i32,
            Error::InvalidParameter => -22,
            Error::MessageTooLarge => -90,
            Error::ResponseTooLarge { .. } => -14,
            Error::ApiChain(_) => -5,
            Error::NoMemory => -12,
            Error::NotInitialized => -19,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueueFull => write!(f, "No free command slots"),
            Error::WouldWrap => write!(f, "Request would wrap the ring"),
            Error::DeviceAbsent => write!(f, "Device absent"),
            Error::ChannelBusy => write!(f, "Management channel busy, retry later"),
            Error::Timeout => write!(f, "Command timeout"),
            Error::ProtocolMismatch => write!(f, "Protocol mismatch"),
            Error::DeviceStatus(status) => {
                write!(f, "Device status {:#04x}: {}", status.0, status.describe())
            }
            Error::InvalidParameter => write!(f, "Invalid parameter"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::ResponseTooLarge { len, capacity } => {
                write!(f, "Response of {} bytes exceeds buffer of {} bytes", len, capacity)
            }
            Error::ApiChain(err) => write!(f, "API command chain: {}", err),
            Error::NoMemory => write!(f, "Out of DMA memory"),
            Error::NotInitialized => write!(f, "Not initialized"),
        }
    }
}

impl std::error::Error for Error {}

/// API command chain failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiChainError {
    /// No free cell in the chain
    Full,
    /// Hardware reported an xor checksum error on a cell
    Checksum,
    /// Consumer index did not reach the producer index in time
    Timeout,
}

impl fmt::Display for ApiChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiChainError::Full => write!(f, "chain full"),
            ApiChainError::Checksum => write!(f, "xor checksum error"),
            ApiChainError::Timeout => write!(f, "completion timeout"),
        }
    }
}

impl From<ApiChainError> for Error {
    fn from(err: ApiChainError) -> Self {
        Error::ApiChain(err)
    }
}

/// Status byte reported by the device in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceStatus(pub u8);

/// Status code to description table
const STATUS_TABLE: &[(u8, &str)] = &[
    (0x00, "success"),
    (0x01, "command failed"),
    (0x02, "invalid parameter"),
    (0x03, "out of resources"),
    (0x04, "resource busy"),
    (0x05, "not initialized"),
    (0x06, "timeout inside firmware"),
    (0x07, "no such object"),
    (0x08, "object already exists"),
    (0x09, "permission denied"),
    (0x0a, "checksum mismatch"),
    (0x0b, "function not ready"),
    (0xfe, "firmware activation in progress"),
    (0xff, "command not supported"),
];

impl DeviceStatus {
    pub const SUCCESS: DeviceStatus = DeviceStatus(0x00);
    pub const BUSY_ACTIVE_FW: DeviceStatus = DeviceStatus(0xfe);
    pub const CMD_UNSUPPORTED: DeviceStatus = DeviceStatus(0xff);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    /// Human-readable cause
    pub fn describe(&self) -> &'static str {
        STATUS_TABLE
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, text)| *text)
            .unwrap_or("unknown status")
    }

    /// `Ok(())` for success, `Err(Error::DeviceStatus)` otherwise
    pub fn check(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::DeviceStatus(self))
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", self.0, self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table_lookup() {
        assert_eq!(DeviceStatus(0x02).describe(), "invalid parameter");
        assert_eq!(DeviceStatus(0xff).describe(), "command not supported");
        assert_eq!(DeviceStatus(0x7f).describe(), "unknown status");
    }

    #[test]
    fn test_status_check() {
        assert!(DeviceStatus::SUCCESS.check().is_ok());
        assert_eq!(
            DeviceStatus(0x03).check(),
            Err(Error::DeviceStatus(DeviceStatus(0x03)))
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::QueueFull.is_retryable());
        assert!(Error::ChannelBusy.is_retryable());
        assert!(!Error::DeviceAbsent.is_retryable());
        assert!(!Error::Timeout.is_retryable());
        assert_eq!(Error::ChannelBusy.code(), 0xfe);
    }
}
