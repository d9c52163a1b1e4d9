use thiserror::Error;

/// Failures surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The underlying store rejected or failed an operation.
    #[error("{0}")]
    Storage(String),

    /// On-disk state failed a checksum or decode step.
    #[error("{0}")]
    Corrupt(String),

    /// A cursor ran past the last entry it can produce.
    #[error("{0}")]
    Exhausted(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<fjall::Error> for EngineError {
    fn from(err: fjall::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}
