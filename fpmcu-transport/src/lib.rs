//! Transport layer for the fingerprint MCU
//!
//! Implements [`fpmcu_core::ControlChannel`] over the kernel control
//! descriptor, plus a scripted in-memory channel for tests.

pub mod dev;
pub mod script;

pub use dev::{DevChannel, CROS_FP_PATH};
pub use script::ScriptedChannel;
