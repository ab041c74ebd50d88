//! Per-thread write-ahead journal: entry framing, the ring buffer, the
//! consumer fanout, the process-wide facade, and the reader/reassembler
//! pair used to replay a journal stream.

mod entry;
mod error;
mod facade;
mod reader;
mod ring;
mod slice;
mod transaction;

pub use entry::{Entry, Lsn, Op};
pub use error::Error;
pub use facade::Facade;
pub use reader::JournalReader;
pub use slice::{ConsumerFn, ConsumerId, FanoutContext};
pub use transaction::{Command, Reassembler, Transaction};
