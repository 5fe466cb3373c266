//! High-level error types

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Core(#[from] fpmcu_core::Error),

    #[error("Type error: {0}")]
    Types(#[from] fpmcu_types::Error),

    #[error("Another session is already active")]
    SessionActive,

    #[error("No space for an additional template")]
    NoSpace,

    #[error("Mode {0} has no wire encoding and cannot be sent to the device")]
    UnencodableMode(fpmcu_core::SensorMode),

    #[error("Template format version {template} does not match device version {device}")]
    TemplateVersionMismatch { template: u16, device: u32 },

    #[error("No newly enrolled template is available")]
    NoNewTemplate,

    #[error("Template slot {slot} out of range (device holds {valid})")]
    InvalidSlot { slot: usize, valid: usize },

    #[error("Positive-match secret is not supported by this device")]
    SecretUnsupported,

    #[error("Record {0} not found")]
    RecordNotFound(String),

    #[error("User id is not valid hex: {0}")]
    InvalidUserId(String),

    #[error("Record storage failed: {0}")]
    Storage(String),
}
