//! The seam between a reassembled transaction and whatever applies it to
//! shard state. This crate only defines the contract; the embedding binary
//! supplies the shard engine.

use async_trait::async_trait;
use thiserror::Error;

use crate::journal::{Command, Transaction};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("shard ran out of memory applying a write")]
    OutOfMemory,

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

impl ExecError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ExecError::OutOfMemory)
    }
}

/// Applies reassembled transactions to shard-local state.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, dbid: u32, tx: &Transaction) -> Result<(), ExecError>;

    /// Whether `cmd` must run on every shard rather than just its own
    /// (e.g. an administrative broadcast), independent of the transaction
    /// that carries it.
    fn is_global_command(&self, cmd: &Command) -> bool;
}
