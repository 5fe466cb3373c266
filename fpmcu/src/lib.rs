//! # fpmcu
//!
//! Host-side driver and session core for a discrete fingerprint-sensor
//! MCU, reachable only through its versioned host-command channel.
//!
//! ## Features
//!
//! - Sensor driver over the raw command channel (mode control, template
//!   transfer, per-user contexts, entropy provisioning)
//! - Event-driven enroll/authenticate session state machine
//! - Positive-match secret validation of match results
//! - Firmware update decision and flashing logic
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use fpmcu::{McuSensor, NoTelemetry};
//! use fpmcu_transport::DevChannel;
//!
//! #[tokio::main]
//! async fn main() -> fpmcu::Result<()> {
//!     let chan = DevChannel::open_default()?;
//!     let sensor = McuSensor::open(chan, Arc::new(NoTelemetry)).await?;
//!     println!("{:?}", sensor.info());
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod error;
pub mod firmware;
pub mod secret;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod updater;

// Re-exports
pub use driver::{McuSensor, SensorDriver};
pub use error::{Error, Result};
pub use firmware::{find_firmware_file, FindFirmwareError, FirmwareImage, ImageError};
pub use secret::compute_validation_value;
pub use session::{SessionHandle, SessionManager, MAX_PARTIAL_ATTEMPTS};
pub use storage::{RecordStorage, StoredRecord, RECORD_FORMAT_VERSION};
pub use telemetry::{NoTelemetry, SharedTelemetry, Telemetry};
pub use updater::{
    decide_update, do_update, BootCtrl, DeviceUpdate, UpdateDecision, UpdateReason, UpdateStatus,
};

// Re-export types
pub use fpmcu_core::{EcResult, FpEvent, Opcode, SensorMode};
pub use fpmcu_types::{
    AttemptMatches, EcImage, EcVersion, EnrollProgress, FpStats, InternalRecord, ScanResult,
    SensorInfo, ValidationValue, VendorTemplate,
};
