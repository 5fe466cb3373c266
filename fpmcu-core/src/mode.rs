//! Sensor operating modes and their wire bitmask

use std::fmt;

use bitflags::bitflags;
use tracing::warn;

bitflags! {
    /// Raw operating-mode bitmask as the hardware defines it.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ModeBits: u32 {
        const DEEPSLEEP      = 1 << 0;
        const FINGER_DOWN    = 1 << 1;
        const FINGER_UP      = 1 << 2;
        const CAPTURE        = 1 << 3;
        const ENROLL_SESSION = 1 << 4;
        const ENROLL_IMAGE   = 1 << 5;
        const MATCH          = 1 << 6;
        const RESET_SENSOR   = 1 << 7;
        const DONT_CHANGE    = 1 << 31;
    }
}

/// Sensor operating mode.
///
/// Closed enumeration over the mode combinations the host ever requests
/// or observes. The raw-to-enum mapping is total: any bitmask outside
/// this set decodes to [`SensorMode::Invalid`], which has no wire
/// encoding and must never be sent back to the hardware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SensorMode {
    None,
    DeepSleep,
    FingerDown,
    FingerUp,
    Capture,
    EnrollSession,
    EnrollSessionFingerUp,
    EnrollSessionEnrollImage,
    EnrollImage,
    Match,
    ResetSensor,
    DontChange,
    Invalid,
}

impl SensorMode {
    /// Decode a raw mode bitmask. Total and never panics; unmapped
    /// values are logged and become `Invalid`.
    pub fn from_raw(raw: u32) -> Self {
        let bits = match ModeBits::from_bits(raw) {
            Some(bits) => bits,
            None => {
                warn!(raw = format!("0x{raw:08X}"), "unmapped sensor mode bits");
                return Self::Invalid;
            }
        };
        match bits {
            b if b == ModeBits::empty() => Self::None,
            b if b == ModeBits::DEEPSLEEP => Self::DeepSleep,
            b if b == ModeBits::FINGER_DOWN => Self::FingerDown,
            b if b == ModeBits::FINGER_UP => Self::FingerUp,
            b if b == ModeBits::CAPTURE => Self::Capture,
            b if b == ModeBits::ENROLL_SESSION => Self::EnrollSession,
            b if b == ModeBits::ENROLL_SESSION | ModeBits::FINGER_UP => {
                Self::EnrollSessionFingerUp
            }
            b if b == ModeBits::ENROLL_SESSION | ModeBits::ENROLL_IMAGE => {
                Self::EnrollSessionEnrollImage
            }
            b if b == ModeBits::ENROLL_IMAGE => Self::EnrollImage,
            b if b == ModeBits::MATCH => Self::Match,
            b if b == ModeBits::RESET_SENSOR => Self::ResetSensor,
            b if b == ModeBits::DONT_CHANGE => Self::DontChange,
            _ => {
                warn!(raw = format!("0x{raw:08X}"), "unmapped sensor mode combination");
                Self::Invalid
            }
        }
    }

    /// Wire encoding, exact inverse of [`from_raw`](Self::from_raw) for
    /// every variant except `Invalid`, which has none.
    pub fn to_raw(self) -> Option<u32> {
        let bits = match self {
            Self::None => ModeBits::empty(),
            Self::DeepSleep => ModeBits::DEEPSLEEP,
            Self::FingerDown => ModeBits::FINGER_DOWN,
            Self::FingerUp => ModeBits::FINGER_UP,
            Self::Capture => ModeBits::CAPTURE,
            Self::EnrollSession => ModeBits::ENROLL_SESSION,
            Self::EnrollSessionFingerUp => ModeBits::ENROLL_SESSION | ModeBits::FINGER_UP,
            Self::EnrollSessionEnrollImage => {
                ModeBits::ENROLL_SESSION | ModeBits::ENROLL_IMAGE
            }
            Self::EnrollImage => ModeBits::ENROLL_IMAGE,
            Self::Match => ModeBits::MATCH,
            Self::ResetSensor => ModeBits::RESET_SENSOR,
            Self::DontChange => ModeBits::DONT_CHANGE,
            Self::Invalid => return None,
        };
        Some(bits.bits())
    }

    /// Whether this mode implies an enroll or auth session is live on
    /// the device. Used to flag context resets issued mid-session.
    pub fn implies_session(self) -> bool {
        matches!(
            self,
            Self::Capture
                | Self::EnrollSession
                | Self::EnrollSessionFingerUp
                | Self::EnrollSessionEnrollImage
                | Self::EnrollImage
                | Self::Match
        )
    }
}

impl fmt::Display for SensorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::DeepSleep => "deepsleep",
            Self::FingerDown => "finger_down",
            Self::FingerUp => "finger_up",
            Self::Capture => "capture",
            Self::EnrollSession => "enroll_session",
            Self::EnrollSessionFingerUp => "enroll_session|finger_up",
            Self::EnrollSessionEnrollImage => "enroll_session|enroll_image",
            Self::EnrollImage => "enroll_image",
            Self::Match => "match",
            Self::ResetSensor => "reset_sensor",
            Self::DontChange => "dont_change",
            Self::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_known_mode_round_trip() {
        let modes = [
            SensorMode::None,
            SensorMode::DeepSleep,
            SensorMode::FingerDown,
            SensorMode::FingerUp,
            SensorMode::Capture,
            SensorMode::EnrollSession,
            SensorMode::EnrollSessionFingerUp,
            SensorMode::EnrollSessionEnrollImage,
            SensorMode::EnrollImage,
            SensorMode::Match,
            SensorMode::ResetSensor,
            SensorMode::DontChange,
        ];
        for mode in modes {
            let raw = mode.to_raw().unwrap();
            assert_eq!(SensorMode::from_raw(raw), mode);
        }
    }

    #[test]
    fn test_invalid_has_no_encoding() {
        assert_eq!(SensorMode::Invalid.to_raw(), None);
    }

    #[test]
    fn test_unmapped_raw_is_invalid() {
        assert_eq!(SensorMode::from_raw(1 << 12), SensorMode::Invalid);
        // A known-bit combination the host never uses is still invalid.
        assert_eq!(
            SensorMode::from_raw((ModeBits::MATCH | ModeBits::CAPTURE).bits()),
            SensorMode::Invalid
        );
    }

    #[test]
    fn test_implies_session() {
        assert!(SensorMode::Match.implies_session());
        assert!(SensorMode::EnrollSessionEnrollImage.implies_session());
        assert!(!SensorMode::None.implies_session());
        assert!(!SensorMode::DeepSleep.implies_session());
        assert!(!SensorMode::DontChange.implies_session());
    }

    proptest! {
        // from_raw is total, and to_raw inverts it everywhere it is defined.
        #[test]
        fn prop_mode_round_trip(raw in any::<u32>()) {
            let mode = SensorMode::from_raw(raw);
            if mode != SensorMode::Invalid {
                prop_assert_eq!(mode.to_raw().unwrap(), raw);
            }
        }
    }
}
