//! Record persistence collaborator
//!
//! The daemon persists one JSON file per record; this core only sees the
//! trait below. Storage failures surface as [`Error::Storage`] and the
//! caller rolls back whatever in-memory mutation triggered the write.

use async_trait::async_trait;

use fpmcu_types::ValidationValue;

use crate::error::Result;

/// On-disk record format version written with new records. Version 1
/// records predate validation values.
pub const RECORD_FORMAT_VERSION: u32 = 2;

/// One record as it crosses the storage boundary. The template blob is
/// base64, exactly as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub format_version: u32,
    pub user_id: String,
    pub label: String,
    pub record_id: String,
    pub validation_value: Option<ValidationValue>,
    pub template_base64: String,
}

/// Key-value persistence for enrollment records.
#[async_trait]
pub trait RecordStorage: Send {
    /// Persist one record, overwriting any previous version.
    async fn write_record(&mut self, record: &StoredRecord) -> Result<()>;

    /// Delete one persisted record.
    async fn delete_record(&mut self, user_id: &str, record_id: &str) -> Result<()>;

    /// All records stored for `user_id`, in stable storage order. That
    /// order re-establishes the on-device slot indices on reload.
    async fn read_records_for_user(&mut self, user_id: &str) -> Result<Vec<StoredRecord>>;

    /// Mint a globally unique id for a new enrollment.
    fn generate_new_record_id(&mut self) -> String;
}
