//! Fingerprint event word decoding
//!
//! The MCU reports capture/match completion by raising an event on the
//! control descriptor. The event payload is a single 32-bit word: the
//! high bits say which kind of event fired, the low bits carry an
//! outcome code plus event-specific fields (enroll progress, matched
//! slot index).

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Event-kind bits of the fingerprint event word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct EventBits: u32 {
        const ENROLL      = 1 << 27;
        const MATCH       = 1 << 28;
        const FINGER_DOWN = 1 << 29;
        const FINGER_UP   = 1 << 30;
    }
}

const ERRCODE_MASK: u32 = 0x0000_000F;
const ENROLL_PROGRESS_MASK: u32 = 0x0000_0FF0;
const ENROLL_PROGRESS_SHIFT: u32 = 4;
const MATCH_IDX_MASK: u32 = 0x0000_F000;
const MATCH_IDX_SHIFT: u32 = 12;

/// One fingerprint event word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FpEvent(pub u32);

impl FpEvent {
    pub fn is_enroll(self) -> bool {
        EventBits::from_bits_truncate(self.0).contains(EventBits::ENROLL)
    }

    pub fn is_match(self) -> bool {
        EventBits::from_bits_truncate(self.0).contains(EventBits::MATCH)
    }

    pub fn is_finger_up(self) -> bool {
        EventBits::from_bits_truncate(self.0).contains(EventBits::FINGER_UP)
    }

    /// Outcome code carried in the low bits.
    pub fn errcode(self) -> u32 {
        self.0 & ERRCODE_MASK
    }

    /// Enroll completion percentage, 0..=100. Meaningful only when
    /// [`is_enroll`](Self::is_enroll) holds.
    pub fn enroll_progress(self) -> u32 {
        (self.0 & ENROLL_PROGRESS_MASK) >> ENROLL_PROGRESS_SHIFT
    }

    /// Matched template slot index. Meaningful only for positive match
    /// outcomes.
    pub fn match_idx(self) -> usize {
        ((self.0 & MATCH_IDX_MASK) >> MATCH_IDX_SHIFT) as usize
    }

    pub fn enroll_result(self) -> EnrollEvent {
        EnrollEvent::from_errcode(self.errcode())
    }

    pub fn match_result(self) -> MatchEvent {
        MatchEvent::from_errcode(self.errcode())
    }
}

impl fmt::Display for FpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FpEvent(0x{:08X})", self.0)
    }
}

/// Outcome of one enroll capture.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EnrollEvent {
    Ok,
    LowQuality,
    Immobile,
    LowCoverage,
    Internal,
    Unknown(u32),
}

impl EnrollEvent {
    pub fn from_errcode(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::LowQuality,
            2 => Self::Immobile,
            3 => Self::LowCoverage,
            5 => Self::Internal,
            other => Self::Unknown(other),
        }
    }
}

/// Outcome of one match attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    No,
    Yes,
    NoLowQuality,
    YesUpdated,
    NoLowCoverage,
    YesUpdateFailed,
    NoInternal,
    NoTemplates,
    Unknown(u32),
}

impl MatchEvent {
    pub fn from_errcode(code: u32) -> Self {
        match code {
            0 => Self::No,
            1 => Self::Yes,
            2 => Self::NoLowQuality,
            3 => Self::YesUpdated,
            4 => Self::NoLowCoverage,
            5 => Self::YesUpdateFailed,
            6 => Self::NoInternal,
            7 => Self::NoTemplates,
            other => Self::Unknown(other),
        }
    }

    /// Whether the device reported a positive match, regardless of the
    /// follow-up template-update status.
    pub fn is_positive(self) -> bool {
        matches!(self, Self::Yes | Self::YesUpdated | Self::YesUpdateFailed)
    }
}
