//! Firmware version information

use std::fmt;

/// Which firmware partition the MCU is currently executing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EcImage {
    Unknown,
    Ro,
    Rw,
}

impl EcImage {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Ro,
            2 => Self::Rw,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for EcImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::Ro => "RO",
            Self::Rw => "RW",
        };
        f.write_str(name)
    }
}

/// Firmware versions as reported live by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcVersion {
    /// Read-only (bootloader) image version string
    pub ro_version: String,

    /// Read-write (runtime) image version string
    pub rw_version: String,

    /// Image currently executing
    pub current_image: EcImage,
}

impl fmt::Display for EcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EcVersion[RO: {}, RW: {}, active: {}]",
            self.ro_version, self.rw_version, self.current_image
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_from_raw() {
        assert_eq!(EcImage::from_raw(1), EcImage::Ro);
        assert_eq!(EcImage::from_raw(2), EcImage::Rw);
        assert_eq!(EcImage::from_raw(0), EcImage::Unknown);
        assert_eq!(EcImage::from_raw(77), EcImage::Unknown);
    }

    #[test]
    fn test_image_display_unique() {
        let all = [EcImage::Unknown, EcImage::Ro, EcImage::Rw];
        let strings: std::collections::HashSet<String> =
            all.iter().map(|i| i.to_string()).collect();
        assert_eq!(strings.len(), all.len());
        assert!(strings.iter().all(|s| !s.is_empty()));
    }
}
