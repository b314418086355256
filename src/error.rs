//! Error types for the capture queue

use thiserror::Error;

/// Result type alias for queue and capture operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while queueing, capturing or persisting references.
///
/// Duplicate enqueues are not represented here: they are reported as the
/// `duplicated` count of an [`EnqueueReport`](crate::EnqueueReport).
#[derive(Error, Debug)]
pub enum Error {
    /// The render engine failed to produce an image
    #[error("Rendering failed: {0}")]
    Render(String),

    /// A partition's shared render session could not be opened
    #[error("Render session could not be established: {0}")]
    SessionEstablish(String),

    /// Render call exceeded its budget
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Any reference store write or read failure
    #[error("Persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// File-system failure (database directory, image output, export)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store connection lock was poisoned by a panicked thread
    #[error("Reference store lock poisoned")]
    LockPoisoned,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A capture result that cannot be applied to an item
    #[error("Invalid capture outcome: {0}")]
    InvalidOutcome(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Render(err.to_string())
    }
}
