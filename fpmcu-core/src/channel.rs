//! Control-channel capability trait
//!
//! One implementor owns the device control descriptor and executes
//! host-command transactions against it. The `&mut self` receivers keep
//! the hardware's own serialization honest: at most one command is ever
//! in flight.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::opcode::Opcode;
use crate::result::EcResult;

/// One encoded host-command request.
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: Opcode,
    /// Wire format version of this command.
    pub version: u8,
    pub payload: Bytes,
    /// Response payload size the host expects the transport to transfer.
    pub response_len: usize,
}

/// Outcome of one completed transaction.
///
/// "Completed" means the transport round-tripped; the hardware result
/// inside may still be anything, including busy or an error code.
#[derive(Debug, Clone)]
pub struct Reply {
    pub result: EcResult,
    pub payload: Bytes,
}

/// Transport for host-command transactions and hardware events.
///
/// Implemented by the real control descriptor in `fpmcu-transport` and by
/// scripted fakes in tests.
#[async_trait]
pub trait ControlChannel: Send {
    /// Execute one request/response transaction. An `Err` means the
    /// transport itself failed (timeout, I/O); the request is untouched
    /// and may be reissued verbatim.
    async fn transact(&mut self, request: &Request) -> Result<Reply>;

    /// Wait for the next fingerprint event word from the device.
    async fn next_event(&mut self) -> Result<u32>;
}
