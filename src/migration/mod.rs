//! Incoming slot-migration subsystem: one [`Flow`] drains each source
//! shard's journal stream; a [`Coordinator`] tracks the migration's overall
//! state machine and finalization handshake.

mod coordinator;
mod error;
mod flow;
mod latch;

pub use coordinator::{Coordinator, KeyCounter, State};
pub use error::Error;
pub use flow::Flow;
pub use latch::CountdownLatch;
