//! Scan outcomes surfaced to session callers

use std::collections::HashMap;
use std::fmt;

/// Closed set of scan results a session caller can observe. Raw
/// hardware codes never cross this boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanResult {
    Success,
    /// Finger covered too little of the sensor
    Partial,
    /// Image quality too low to use
    Insufficient,
    SensorDirty,
    TooSlow,
    TooFast,
    /// Finger did not move between enroll captures
    Immobile,
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Insufficient => "insufficient",
            Self::SensorDirty => "sensor_dirty",
            Self::TooSlow => "too_slow",
            Self::TooFast => "too_fast",
            Self::Immobile => "immobile",
        };
        f.write_str(name)
    }
}

/// Enrollment progress reported with each enroll scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EnrollProgress {
    pub done: bool,
    pub percent: u32,
}

/// Successful matches of one auth scan: user id to matched record ids.
/// Empty means the scan completed but matched nobody.
pub type AttemptMatches = HashMap<String, Vec<String>>;

/// Capture/match timing reported by the device, in milliseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FpStats {
    pub capture_ms: u32,
    pub matcher_ms: u32,
    pub overall_ms: u32,
}
