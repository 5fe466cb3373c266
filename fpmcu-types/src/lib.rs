//! Type definitions for fpmcu

pub mod error;
pub mod info;
pub mod record;
pub mod scan;
pub mod version;

pub use error::{Error, Result};
pub use info::SensorInfo;
pub use record::{InternalRecord, ValidationValue, VendorTemplate};
pub use scan::{AttemptMatches, EnrollProgress, FpStats, ScanResult};
pub use version::{EcImage, EcVersion};
