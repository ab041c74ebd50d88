//! Migration-layer errors.

use thiserror::Error;

use crate::executor::ExecError;
use crate::journal;

#[derive(Debug, Error)]
pub enum Error {
    #[error("journal stream error: {0}")]
    Journal(#[from] journal::Error),

    #[error("shard ran out of memory during migration replay")]
    OutOfMemory,

    #[error("global command rejected during migration: {0}")]
    UnsupportedCommand(String),

    #[error("migration did not finalize within the configured timeout")]
    FinalizationTimeout,

    #[error("executor error: {0}")]
    Exec(#[from] ExecError),
}
