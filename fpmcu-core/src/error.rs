//! Error types for fpmcu-core

use crate::opcode::Opcode;
use crate::result::EcResult;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol and channel errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level timeout; the device never answered the transaction
    #[error("Transport timeout talking to the device")]
    Timeout,

    /// Device reported a definite non-success result
    #[error("Device returned {result} for {opcode}")]
    Device { opcode: Opcode, result: EcResult },

    /// Transport completed but transferred an unexpected response size
    #[error("Response size mismatch for {opcode}: expected {expected} bytes, got {actual} bytes")]
    ResponseSize {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },

    /// Request payload exceeds the transfer ceiling
    #[error("Request payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    /// Async command did not reach success within its attempt ceiling
    #[error("Command did not complete after {attempts} polls (last result: {last_result})")]
    PollExhausted {
        attempts: u32,
        last_result: EcResult,
    },

    /// Unknown opcode value
    #[error("Unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    /// Channel is closed or was never opened
    #[error("Control channel closed")]
    ChannelClosed,

    /// I/O error on the control descriptor
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transport-level failures that did not produce a definite hardware
    /// result; only these are safe to retry blindly.
    pub fn is_transport_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Definite hardware result carried by this error, if any.
    pub fn device_result(&self) -> Option<EcResult> {
        match self {
            Self::Device { result, .. } => Some(*result),
            _ => None,
        }
    }
}
