//! # fpmcu-core
//!
//! Wire protocol for the fingerprint-sensor MCU host-command channel.
//!
//! This crate provides the low-level protocol primitives:
//! - Host-command framing and sync/async execution
//! - Hardware result codes
//! - Opcode definitions
//! - Sensor operating modes and their raw bitmask
//! - Fingerprint event word decoding
//! - The [`ControlChannel`] capability trait the transport implements

pub mod channel;
pub mod command;
pub mod error;
pub mod event;
pub mod mode;
pub mod opcode;
pub mod result;

pub use channel::{ControlChannel, Reply, Request};
pub use command::{AsyncHostCommand, HostCommand, MAX_IO_ATTEMPTS, MAX_PACKET_SIZE};
pub use error::{Error, Result};
pub use event::{EnrollEvent, EventBits, FpEvent, MatchEvent};
pub use mode::{ModeBits, SensorMode};
pub use opcode::Opcode;
pub use result::EcResult;
