//! Validation-value derivation
//!
//! Each record stores a value derived once at enrollment from the
//! device-held per-record secret and the owning user id. At match time
//! the value is re-derived from the secret the device currently holds
//! for the matched slot; only an exact match confirms the result. The
//! derivation is one-way: the stored value reveals nothing about the
//! secret.

use sha2::{Digest, Sha256};

use fpmcu_types::ValidationValue;

use crate::error::{Error, Result};

/// Derive the validation value for `secret` scoped to `user_id_hex`.
///
/// Deterministic: the same inputs always produce the same value.
pub fn compute_validation_value(secret: &[u8], user_id_hex: &str) -> Result<ValidationValue> {
    let user_id = hex::decode(user_id_hex)
        .map_err(|_| Error::InvalidUserId(user_id_hex.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(&user_id);
    let digest = hasher.finalize();

    Ok(ValidationValue::new(digest.into()))
}
