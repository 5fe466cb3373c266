pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Template too short: {actual} bytes (need at least {needed})")]
    TemplateTooShort { needed: usize, actual: usize },

    #[error("Validation value must be {expected} bytes, got {actual}")]
    ValidationValueLength { expected: usize, actual: usize },
}
