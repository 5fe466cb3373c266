//! Host-command execution
//!
//! A [`HostCommand`] is one fixed-layout request/response transaction.
//! Request and expected response sizes are fixed at construction; a
//! transaction only succeeds when the transport transfers exactly the
//! expected response size and the hardware result is success.
//!
//! [`AsyncHostCommand`] wraps a command whose completion the device
//! signals later: the initial transaction starts the operation, then the
//! host polls a "get result" sub-action until the result turns from busy
//! into success or the attempt ceiling is hit.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channel::{ControlChannel, Reply, Request};
use crate::error::{Error, Result};
use crate::opcode::Opcode;
use crate::result::EcResult;

/// Upper bound of one host-command packet transfer.
pub const MAX_PACKET_SIZE: usize = 544;

/// IO attempts for commands known to hit spurious transport timeouts.
pub const MAX_IO_ATTEMPTS: u32 = 2;

/// One host-command transaction.
#[derive(Debug, Clone)]
pub struct HostCommand {
    opcode: Opcode,
    version: u8,
    request: Bytes,
    response_len: usize,
    result: EcResult,
    response: Bytes,
}

impl HostCommand {
    /// Create a command with an empty request and no response payload.
    pub fn new(opcode: Opcode, version: u8) -> Self {
        Self {
            opcode,
            version,
            request: Bytes::new(),
            response_len: 0,
            result: EcResult::Unset,
            response: Bytes::new(),
        }
    }

    /// Create a command with a request payload and expected response size.
    pub fn with_request(
        opcode: Opcode,
        version: u8,
        request: impl Into<Bytes>,
        response_len: usize,
    ) -> Self {
        Self {
            opcode,
            version,
            request: request.into(),
            response_len,
            result: EcResult::Unset,
            response: Bytes::new(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Replace the request payload (e.g. for the next chunk of a
    /// transfer). Does not touch the recorded result.
    pub fn set_request(&mut self, request: impl Into<Bytes>) {
        self.request = request.into();
    }

    pub fn set_response_len(&mut self, response_len: usize) {
        self.response_len = response_len;
    }

    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// Hardware result of the last completed transaction, or
    /// [`EcResult::Unset`] when the transport never completed one.
    pub fn result(&self) -> EcResult {
        self.result
    }

    /// Response payload of the last successful transaction.
    pub fn response(&self) -> &Bytes {
        &self.response
    }

    /// Execute one transaction.
    ///
    /// The request buffer is left byte-identical on failure, so the
    /// command may be reissued verbatim. The result code is reset to the
    /// sentinel first and recorded whenever the transport completes a
    /// transfer, whatever the code says.
    pub async fn run(&mut self, chan: &mut dyn ControlChannel) -> Result<()> {
        self.result = EcResult::Unset;
        let request = Request {
            opcode: self.opcode,
            version: self.version,
            payload: self.request.clone(),
            response_len: self.response_len,
        };
        let Reply { result, payload } = chan.transact(&request).await?;
        self.result = result;

        if !result.is_success() {
            return Err(Error::Device {
                opcode: self.opcode,
                result,
            });
        }
        if payload.len() != self.response_len {
            return Err(Error::ResponseSize {
                opcode: self.opcode,
                expected: self.response_len,
                actual: payload.len(),
            });
        }
        self.response = payload;
        Ok(())
    }

    /// Execute with a bounded number of attempts.
    ///
    /// Retries only transport-level timeouts. A definite hardware result
    /// is never retried: the device already processed the command once.
    pub async fn run_with_attempts(
        &mut self,
        chan: &mut dyn ControlChannel,
        attempts: u32,
    ) -> Result<()> {
        debug_assert!(attempts > 0);
        let mut last = Error::Timeout;
        for attempt in 1..=attempts {
            match self.run(chan).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(
                            opcode = %self.opcode,
                            attempt,
                            attempts,
                            "command succeeded after transport timeout"
                        );
                    }
                    return Ok(());
                }
                Err(err) if err.is_transport_timeout() && attempt < attempts => {
                    warn!(opcode = %self.opcode, attempt, attempts, "transport timeout, retrying");
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }
}

/// Ask the device which wire versions of `opcode` it implements.
///
/// Returns the supported-version bitmask, or `None` when the device
/// definitively answered that it does not know the command at all (an
/// invalid-parameter result). That answer is a normal negative, not a
/// transport failure, and is never retried.
pub async fn query_cmd_versions(
    chan: &mut dyn ControlChannel,
    opcode: Opcode,
) -> Result<Option<u32>> {
    let mut payload = BytesMut::with_capacity(2);
    payload.put_u16_le(opcode.into());

    let mut cmd = HostCommand::with_request(Opcode::GetCmdVersions, 1, payload.freeze(), 4);
    match cmd.run_with_attempts(chan, MAX_IO_ATTEMPTS).await {
        Ok(()) => {
            let mut resp = cmd.response().clone();
            Ok(Some(resp.get_u32_le()))
        }
        Err(Error::Device {
            result: EcResult::InvalidParam,
            ..
        }) => Ok(None),
        Err(err) => Err(err),
    }
}

/// A host command completed by polling.
#[derive(Debug, Clone)]
pub struct AsyncHostCommand {
    cmd: HostCommand,
    /// Request payload reissued on each poll, with the action field set
    /// to "get result".
    poll_request: Bytes,
    attempts: u32,
    interval: Duration,
    strict: bool,
    allow_transport_timeout: bool,
}

impl AsyncHostCommand {
    pub fn new(cmd: HostCommand, poll_request: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            poll_request: poll_request.into(),
            attempts: 20,
            interval: Duration::from_millis(100),
            strict: false,
            allow_transport_timeout: false,
        }
    }

    /// Set the poll attempt ceiling
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Treat any result other than success or busy as a hard failure.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// The device may stop answering mid-operation (e.g. while rolling
    /// its flash): swallow transport timeouts during polling and keep
    /// going until the attempt ceiling.
    pub fn allow_transport_timeout(mut self) -> Self {
        self.allow_transport_timeout = true;
        self
    }

    pub fn result(&self) -> EcResult {
        self.cmd.result()
    }

    /// Start the operation, then poll it to completion.
    pub async fn run(&mut self, chan: &mut dyn ControlChannel) -> Result<()> {
        self.cmd.run(chan).await?;

        for _ in 0..self.attempts {
            sleep(self.interval).await;

            self.cmd.set_request(self.poll_request.clone());
            match self.cmd.run(chan).await {
                Ok(()) => return Ok(()),
                Err(Error::Device { result, .. }) if result.is_busy() => continue,
                Err(err @ Error::Device { .. }) if self.strict => return Err(err),
                Err(Error::Device { result, .. }) => {
                    // Only success ends a relaxed poll; the device may
                    // report transitional codes while the operation runs.
                    debug!(opcode = %self.cmd.opcode(), %result, "poll result, continuing");
                    continue;
                }
                Err(err) if err.is_transport_timeout() && self.allow_transport_timeout => {
                    debug!(opcode = %self.cmd.opcode(), "transport timeout during poll, continuing");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::PollExhausted {
            attempts: self.attempts,
            last_result: self.cmd.result(),
        })
    }
}
