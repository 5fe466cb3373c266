//! Enrollment records and vendor templates

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Opaque template blob understood only by the sensor firmware.
///
/// The first two bytes carry the little-endian format version of the
/// encryption metadata; the host checks it against the version the
/// device expects before uploading, and never interprets the rest.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct VendorTemplate(Vec<u8>);

impl VendorTemplate {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Format version embedded in the blob.
    pub fn format_version(&self) -> Result<u16> {
        if self.0.len() < 2 {
            return Err(Error::TemplateTooShort {
                needed: 2,
                actual: self.0.len(),
            });
        }
        Ok(LittleEndian::read_u16(&self.0[..2]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for VendorTemplate {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

// The blob prints as its length, not its bytes.
impl fmt::Debug for VendorTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VendorTemplate({} bytes)", self.0.len())
    }
}

/// Fixed-length, secret-derived byte string stored with each record and
/// re-derived at match time to confirm a positive match's authenticity.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ValidationValue([u8; Self::LEN]);

impl ValidationValue {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for ValidationValue {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; Self::LEN] =
            bytes
                .try_into()
                .map_err(|_| Error::ValidationValueLength {
                    expected: Self::LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for ValidationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidationValue({})", hex::encode(self.0))
    }
}

/// One enrolled record as held in memory.
///
/// Records live in an ordered collection whose position is the on-device
/// template slot index. That coupling is load-bearing: removal clears
/// and reloads the whole collection instead of shifting entries, because
/// the device's own slot table cannot be shifted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRecord {
    /// Globally unique id generated at enrollment
    pub record_id: String,
    pub user_id: String,
    pub label: String,
    /// Present when the device supports positive-match secrets
    pub validation_value: Option<ValidationValue>,
}
