//! Packaged firmware image handling
//!
//! Locates the one packaged firmware file and reads its RO/RW version
//! strings out of the flash map (FMAP) embedded in the image.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Buf;
use tracing::{debug, info};

/// FMAP signature marking the start of the flash map.
const FMAP_SIGNATURE: &[u8] = b"__FMAP__";

// Fixed layout: signature(8) ver(2) base(8) size(4) name(32) nareas(2),
// then one 42-byte entry per area.
const FMAP_HEADER_LEN: usize = 56;
const FMAP_AREA_LEN: usize = 42;
const FMAP_NAME_LEN: usize = 32;

/// FMAP areas holding the version strings.
const AREA_RO_VERSION: &str = "RO_FRID";
const AREA_RW_VERSION: &str = "RW_FWID";

/// Firmware files are named `<board>_fp_<version>.bin`.
const FIRMWARE_GLOB_INFIX: &str = "_fp_";
const FIRMWARE_GLOB_SUFFIX: &str = ".bin";

/// Distinct outcomes of the firmware file search.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FindFirmwareError {
    #[error("Firmware directory does not exist")]
    NoDirectory,

    #[error("No firmware file found in the firmware directory")]
    FileNotFound,

    #[error("More than one firmware file found in the firmware directory")]
    MultipleFiles,
}

/// Errors decoding a packaged firmware image.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Firmware file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read firmware file: {0}")]
    Read(#[from] io::Error),

    #[error("Firmware map is missing or malformed in {0}")]
    BadFmap(PathBuf),
}

/// Scan `dir` for exactly one file matching the firmware name pattern.
pub fn find_firmware_file(dir: &Path) -> Result<PathBuf, FindFirmwareError> {
    let entries = std::fs::read_dir(dir).map_err(|_| FindFirmwareError::NoDirectory)?;

    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(FIRMWARE_GLOB_SUFFIX) && name.contains(FIRMWARE_GLOB_INFIX) {
            matches.push(path);
        }
    }

    match matches.len() {
        0 => Err(FindFirmwareError::FileNotFound),
        1 => {
            info!(path = %matches[0].display(), "found firmware file");
            Ok(matches.remove(0))
        }
        _ => Err(FindFirmwareError::MultipleFiles),
    }
}

/// A packaged firmware image with its parsed version strings.
///
/// Read-only once constructed; decoding fails rather than producing a
/// half-valid image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    path: PathBuf,
    ro_version: String,
    rw_version: String,
}

impl FirmwareImage {
    /// Decode the image at `path`: locate the embedded FMAP and read
    /// the RO/RW version areas.
    pub fn decode(path: impl Into<PathBuf>) -> Result<Self, ImageError> {
        let path = path.into();
        if !path.exists() {
            return Err(ImageError::NotFound(path));
        }
        let data = std::fs::read(&path)?;

        let Some((ro_version, rw_version)) = parse_fmap_versions(&data) else {
            return Err(ImageError::BadFmap(path));
        };

        debug!(
            path = %path.display(),
            ro = ro_version,
            rw = rw_version,
            "decoded firmware image"
        );
        Ok(Self {
            path,
            ro_version,
            rw_version,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ro_version(&self) -> &str {
        &self.ro_version
    }

    pub fn rw_version(&self) -> &str {
        &self.rw_version
    }

    #[cfg(test)]
    pub(crate) fn for_tests(path: &str, ro: &str, rw: &str) -> Self {
        Self {
            path: PathBuf::from(path),
            ro_version: ro.into(),
            rw_version: rw.into(),
        }
    }
}

impl fmt::Display for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FirmwareImage[{}, RO: {}, RW: {}]",
            self.path.display(),
            self.ro_version,
            self.rw_version
        )
    }
}

/// Walk the FMAP area table and pull out both version strings. `None`
/// for any structural problem: no signature, truncated header or table,
/// out-of-range areas, missing version areas.
fn parse_fmap_versions(data: &[u8]) -> Option<(String, String)> {
    let fmap_start = data
        .windows(FMAP_SIGNATURE.len())
        .position(|w| w == FMAP_SIGNATURE)?;
    let fmap = &data[fmap_start..];
    if fmap.len() < FMAP_HEADER_LEN {
        return None;
    }

    let mut header = &fmap[FMAP_SIGNATURE.len()..FMAP_HEADER_LEN];
    let _ver_major = header.get_u8();
    let _ver_minor = header.get_u8();
    let _base = header.get_u64_le();
    let _size = header.get_u32_le();
    header.advance(FMAP_NAME_LEN);
    let nareas = header.get_u16_le() as usize;

    let table = &fmap[FMAP_HEADER_LEN..];
    if table.len() < nareas * FMAP_AREA_LEN {
        return None;
    }

    let mut ro_version = None;
    let mut rw_version = None;
    for i in 0..nareas {
        let mut area = &table[i * FMAP_AREA_LEN..(i + 1) * FMAP_AREA_LEN];
        let offset = area.get_u32_le() as usize;
        let size = area.get_u32_le() as usize;
        let name = trimmed_str(&area[..FMAP_NAME_LEN]);

        let slot = match name.as_str() {
            AREA_RO_VERSION => &mut ro_version,
            AREA_RW_VERSION => &mut rw_version,
            _ => continue,
        };
        if offset > data.len() || size > data.len() - offset {
            return None;
        }
        *slot = Some(trimmed_str(&data[offset..offset + size]));
    }

    Some((ro_version?, rw_version?))
}

fn trimmed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}
