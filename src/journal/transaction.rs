//! Reassembles the framed entry stream back into transactions, joining the
//! per-shard steps of a multi-shard write with its commit marker.

use std::collections::HashMap;

use super::entry::{Entry, Lsn, Op};
use super::error::Error;
use super::reader::JournalReader;
use crate::context::Context;
use tokio::io::AsyncRead;

/// A single logged command, with its dbid carried alongside for
/// convenience (every part of a transaction shares one dbid).
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub dbid: u32,
    pub argv: Vec<bytes::Bytes>,
}

/// A fully reassembled unit of work ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    /// One or more commands sharing a txid, committed together.
    Write {
        txid: u64,
        commands: Vec<Command>,
    },
    /// A shard selector; carries no data of its own.
    Select { dbid: u32 },
    /// A keepalive with no effect on state.
    Ping,
    /// A quiescence proposal naming the LSN the sender has reached.
    LsnMarker { dbid: u32, target: Lsn },
    /// The sender will send nothing more on this stream.
    Fin,
}

#[derive(Default)]
struct PendingWrite {
    dbid: u32,
    commands: Vec<Command>,
    shard_cnt: u32,
}

/// Accumulates in-flight multi-shard transactions, keyed by txid, and
/// yields [`Transaction`] values as they complete.
pub struct Reassembler<R> {
    reader: JournalReader<R>,
    pending: HashMap<u64, PendingWrite>,
}

impl<R: AsyncRead + Unpin> Reassembler<R> {
    pub fn new(reader: JournalReader<R>) -> Self {
        Self {
            reader,
            pending: HashMap::new(),
        }
    }

    /// Read and reassemble the next transaction. Loops internally over raw
    /// entries until a complete transaction (or a zero-command pseudo
    /// transaction) is ready.
    pub async fn next_tx(&mut self, cntx: &Context) -> Result<Transaction, Error> {
        loop {
            let entry = self.reader.read_entry(cntx).await?;
            if let Some(tx) = self.absorb(entry)? {
                return Ok(tx);
            }
        }
    }

    fn absorb(&mut self, entry: Entry) -> Result<Option<Transaction>, Error> {
        match entry.opcode {
            Op::Noop => Ok(None),

            Op::Select => Ok(Some(Transaction::Select { dbid: entry.dbid })),

            Op::Ping => Ok(Some(Transaction::Ping)),

            Op::Fin => Ok(Some(Transaction::Fin)),

            Op::Lsn => {
                let target = entry
                    .target_lsn()
                    .ok_or(Error::Malformed("lsn marker missing target"))?;
                Ok(Some(Transaction::LsnMarker {
                    dbid: entry.dbid,
                    target,
                }))
            }

            Op::Command => Ok(Some(Transaction::Write {
                txid: entry.txid,
                commands: vec![Command {
                    dbid: entry.dbid,
                    argv: entry.payload,
                }],
            })),

            Op::MultiCommand => {
                let pending = self.pending.entry(entry.txid).or_insert_with(|| PendingWrite {
                    dbid: entry.dbid,
                    commands: Vec::new(),
                    shard_cnt: entry.shard_cnt,
                });
                pending.commands.push(Command {
                    dbid: entry.dbid,
                    argv: entry.payload,
                });
                Ok(None)
            }

            Op::Exec => {
                let pending = self
                    .pending
                    .remove(&entry.txid)
                    .ok_or(Error::Malformed("exec with no matching steps"))?;
                if pending.commands.len() as u32 != pending.shard_cnt.max(entry.shard_cnt) {
                    return Err(Error::Malformed("exec shard count mismatch"));
                }
                Ok(Some(Transaction::Write {
                    txid: entry.txid,
                    commands: pending.commands,
                }))
            }
        }
    }
}
