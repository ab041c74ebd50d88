//! Journal-layer errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection closed cleanly at an entry boundary")]
    ShortRead,

    #[error("malformed entry frame: {0}")]
    Malformed(&'static str),

    #[error("journal transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no slice initialized on this thread")]
    SliceNotInitialized,
}

impl Error {
    /// Whether this error means the stream must be abandoned rather than retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Malformed(_) | Error::Io(_))
    }
}
