//! Per-thread write-ahead journal and incoming slot-migration subsystem for
//! a sharded, in-memory key-value store. Each shard thread owns one
//! [`journal::Facade`]-backed slice; an [`migration::Coordinator`] drives the
//! receiving side of a live re-sharding handshake against it.
//!
//! The command executor, socket transport, and scheduler pool are
//! deliberately external: this crate defines them as traits
//! ([`executor::Executor`], [`socket::JournalSocket`], [`scheduler::SchedulerPool`])
//! and never implements them.

pub mod config;
pub mod context;
pub mod executor;
pub mod journal;
pub mod migration;
pub mod scheduler;
pub mod socket;

pub use context::Context;

/// Install a `tracing` subscriber reading `RUST_LOG` (or `info` by
/// default). Optional: the embedding binary is free to install its own
/// subscriber instead, this is just the default this crate's own examples
/// and tests would reach for.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
