//! Hardware result codes returned in host-command responses

use std::fmt;

/// Result code reported by the MCU for one host command.
///
/// The code travels in the response header of every transaction. `Unset`
/// is a host-side sentinel: a command carries it before each transaction
/// and it is overwritten only once the transport reports a completed
/// transfer, so a transport failure can never leave a stale code behind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EcResult {
    Success,
    InvalidCommand,
    Error,
    InvalidParam,
    AccessDenied,
    InvalidResponse,
    InvalidVersion,
    InvalidChecksum,
    InProgress,
    Unavailable,
    Timeout,
    Overflow,
    InvalidHeader,
    RequestTruncated,
    ResponseTooBig,
    BusError,
    Busy,
    /// Host-side sentinel, never sent by the device.
    Unset,
    /// Raw code with no known mapping.
    Unknown(u16),
}

impl EcResult {
    /// Raw value of the host-side `Unset` sentinel.
    pub const UNSET_RAW: u16 = 0xFFFF;

    /// Map a raw wire code to a result. Total: unmapped codes become
    /// [`EcResult::Unknown`].
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::InvalidCommand,
            2 => Self::Error,
            3 => Self::InvalidParam,
            4 => Self::AccessDenied,
            5 => Self::InvalidResponse,
            6 => Self::InvalidVersion,
            7 => Self::InvalidChecksum,
            8 => Self::InProgress,
            9 => Self::Unavailable,
            10 => Self::Timeout,
            11 => Self::Overflow,
            12 => Self::InvalidHeader,
            13 => Self::RequestTruncated,
            14 => Self::ResponseTooBig,
            15 => Self::BusError,
            16 => Self::Busy,
            Self::UNSET_RAW => Self::Unset,
            other => Self::Unknown(other),
        }
    }

    /// Raw wire value.
    pub fn raw(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::InvalidCommand => 1,
            Self::Error => 2,
            Self::InvalidParam => 3,
            Self::AccessDenied => 4,
            Self::InvalidResponse => 5,
            Self::InvalidVersion => 6,
            Self::InvalidChecksum => 7,
            Self::InProgress => 8,
            Self::Unavailable => 9,
            Self::Timeout => 10,
            Self::Overflow => 11,
            Self::InvalidHeader => 12,
            Self::RequestTruncated => 13,
            Self::ResponseTooBig => 14,
            Self::BusError => 15,
            Self::Busy => 16,
            Self::Unset => Self::UNSET_RAW,
            Self::Unknown(raw) => raw,
        }
    }

    /// Check if the command completed successfully
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Check if the device reported it is still working on the command
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Get result name
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "RES_SUCCESS",
            Self::InvalidCommand => "RES_INVALID_COMMAND",
            Self::Error => "RES_ERROR",
            Self::InvalidParam => "RES_INVALID_PARAM",
            Self::AccessDenied => "RES_ACCESS_DENIED",
            Self::InvalidResponse => "RES_INVALID_RESPONSE",
            Self::InvalidVersion => "RES_INVALID_VERSION",
            Self::InvalidChecksum => "RES_INVALID_CHECKSUM",
            Self::InProgress => "RES_IN_PROGRESS",
            Self::Unavailable => "RES_UNAVAILABLE",
            Self::Timeout => "RES_TIMEOUT",
            Self::Overflow => "RES_OVERFLOW",
            Self::InvalidHeader => "RES_INVALID_HEADER",
            Self::RequestTruncated => "RES_REQUEST_TRUNCATED",
            Self::ResponseTooBig => "RES_RESPONSE_TOO_BIG",
            Self::BusError => "RES_BUS_ERROR",
            Self::Busy => "RES_BUSY",
            Self::Unset => "RES_UNSET",
            Self::Unknown(_) => "RES_UNKNOWN",
        }
    }
}

impl fmt::Display for EcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_round_trip() {
        for raw in 0..=16 {
            assert_eq!(EcResult::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let res = EcResult::from_raw(200);
        assert_eq!(res, EcResult::Unknown(200));
        assert_eq!(res.raw(), 200);
    }

    #[test]
    fn test_unset_sentinel() {
        assert_eq!(EcResult::from_raw(EcResult::UNSET_RAW), EcResult::Unset);
        assert!(!EcResult::Unset.is_success());
    }

    #[test]
    fn test_is_busy() {
        assert!(EcResult::Busy.is_busy());
        assert!(!EcResult::Success.is_busy());
        assert!(EcResult::Success.is_success());
    }
}
