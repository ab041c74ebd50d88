//! Per-source-shard drain loop: reads a journal stream, reassembles
//! transactions, replays them through the executor, and runs the
//! LSN-quiescence handshake used to finalize the migration.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::context::Context;
use crate::executor::Executor;
use crate::journal::{Error as JournalError, JournalReader, Reassembler, Transaction};
use crate::socket::{Direction, JournalSocket};

use super::coordinator::CoordinatorHandle;
use super::error::Error as MigrationError;
use super::latch::CountdownLatch;

fn primary_dbid(tx: &Transaction) -> u32 {
    match tx {
        Transaction::Write { commands, .. } => commands.first().map(|c| c.dbid).unwrap_or(0),
        Transaction::Select { dbid } => *dbid,
        Transaction::LsnMarker { dbid, .. } => *dbid,
        Transaction::Ping | Transaction::Fin => 0,
    }
}

/// Drains one source shard's journal stream into the local executor.
pub struct Flow {
    source_shard_id: usize,
    finished: Mutex<bool>,
    socket: Mutex<Option<Arc<dyn JournalSocket>>>,
    last_attempt: AtomicI64,
    pause: AtomicBool,
    cntx: Context,
    latch: Arc<CountdownLatch>,
    coordinator: CoordinatorHandle,
}

impl Flow {
    pub(crate) fn new(
        source_shard_id: usize,
        latch: Arc<CountdownLatch>,
        coordinator: CoordinatorHandle,
    ) -> Self {
        Self {
            source_shard_id,
            finished: Mutex::new(false),
            socket: Mutex::new(None),
            last_attempt: AtomicI64::new(-1),
            pause: AtomicBool::new(false),
            cntx: Context::new(),
            latch,
            coordinator,
        }
    }

    pub fn source_shard_id(&self) -> usize {
        self.source_shard_id
    }

    pub fn last_attempt(&self) -> Option<u64> {
        match self.last_attempt.load(Ordering::SeqCst) {
            -1 => None,
            n => Some(n as u64),
        }
    }

    pub fn set_pause(&self, paused: bool) {
        self.pause.store(paused, Ordering::SeqCst);
    }

    pub fn context(&self) -> &Context {
        &self.cntx
    }

    /// Drain `socket` until the stream ends, the context is cancelled, or an
    /// unrecoverable error occurs. Safe to call at most once; later calls
    /// after the first are no-ops.
    #[instrument(skip(self, executor, socket), fields(source_shard_id = self.source_shard_id))]
    pub async fn start(&self, executor: Arc<dyn Executor>, socket: Arc<dyn JournalSocket>) {
        {
            let mut finished = self.finished.lock();
            if *finished {
                return;
            }
            *finished = true;
        }
        *self.socket.lock() = Some(socket.clone());
        let _release = ReleaseSocket(self);

        let mut reassembler = Reassembler::new(JournalReader::new(socket.take_reader()));
        let cfg = crate::config::config();
        let mut pending: Option<Transaction> = None;

        loop {
            if !self.cntx.is_running() {
                break;
            }
            if self.pause.load(Ordering::SeqCst) {
                tokio::time::sleep(cfg.pause_poll_interval()).await;
                continue;
            }

            let tx = match pending.take() {
                Some(tx) => tx,
                None => {
                    let read = tokio::select! {
                        _ = self.cntx.cancelled() => break,
                        result = reassembler.next_tx(&self.cntx) => result,
                    };
                    match read {
                        Ok(tx) => tx,
                        Err(e) => {
                            warn!(error = %e, "journal read failed, aborting flow");
                            self.cntx.report_error(&e);
                            break;
                        }
                    }
                }
            };

            if let Transaction::LsnMarker { target, .. } = &tx {
                self.last_attempt.store(target.get() as i64, Ordering::SeqCst);
                self.latch.decrement();
                debug!(target = target.get(), "quiescence attempt proposed");

                let next = tokio::select! {
                    _ = self.cntx.cancelled() => break,
                    result = reassembler.next_tx(&self.cntx) => result,
                };
                match next {
                    Err(JournalError::ShortRead) => {
                        debug!("source closed cleanly at quiescence target, finalized");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading past quiescence marker");
                        self.cntx.report_error(&e);
                        return;
                    }
                    Ok(_) if self.coordinator.is_fatal() => return,
                    Ok(more) => {
                        self.latch.increment();
                        pending = Some(more);
                        continue;
                    }
                }
            }

            if matches!(tx, Transaction::Ping) {
                continue;
            }

            if let Transaction::Write { commands, .. } = &tx {
                if let Some(cmd) = commands.iter().find(|c| executor.is_global_command(c)) {
                    let err = MigrationError::UnsupportedCommand(format!("dbid {}", cmd.dbid));
                    self.cntx.report_error(&err);
                    self.coordinator.report_error(&err);
                    continue;
                }
            }

            match executor.execute(primary_dbid(&tx), &tx).await {
                Ok(()) => {}
                Err(e) if e.is_out_of_memory() => {
                    let err = MigrationError::OutOfMemory;
                    self.coordinator.mark_fatal(&err);
                    self.cntx.report_error(&err);
                    break;
                }
                Err(e) => {
                    let err = MigrationError::Exec(e);
                    warn!(error = %err, "transaction replay failed");
                    self.cntx.report_error(&err);
                }
            }
        }

        self.latch.decrement();
    }

    /// Half-close the bound socket to unblock an in-flight read, or, if the
    /// flow never started, mark it finished directly so `join` doesn't wait
    /// on it forever.
    pub fn cancel(&self) {
        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            socket.shutdown(Direction::Both);
            return;
        }

        let mut finished = self.finished.lock();
        if !*finished {
            *finished = true;
            drop(finished);
            self.latch.decrement();
        }
    }
}

struct ReleaseSocket<'a>(&'a Flow);

impl Drop for ReleaseSocket<'_> {
    fn drop(&mut self) {
        *self.0.socket.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecError;
    use crate::journal::Command;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::sync::atomic::AtomicU64;
    use tokio::io::AsyncRead;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingExecutor {
        applied: Arc<AsyncMutex<Vec<String>>>,
        oom_after: Option<usize>,
        count: AtomicU64,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(&self, _dbid: u32, tx: &Transaction) -> Result<(), ExecError> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) as usize;
            if let Some(oom_at) = self.oom_after {
                if n == oom_at {
                    return Err(ExecError::OutOfMemory);
                }
            }
            if let Transaction::Write { commands, .. } = tx {
                for c in commands {
                    let argv: Vec<String> = c
                        .argv
                        .iter()
                        .map(|b| String::from_utf8_lossy(b).to_string())
                        .collect();
                    self.applied.lock().await.push(argv.join(" "));
                }
            }
            Ok(())
        }

        fn is_global_command(&self, _cmd: &Command) -> bool {
            false
        }
    }

    struct FakeSocket {
        data: Mutex<Option<Vec<u8>>>,
    }

    impl FakeSocket {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data: Mutex::new(Some(data)),
            }
        }
    }

    impl JournalSocket for FakeSocket {
        fn take_reader(&self) -> Box<dyn AsyncRead + Unpin + Send> {
            let data = self.data.lock().take().expect("reader already taken");
            Box::new(Cursor::new(data))
        }

        fn shutdown(&self, _direction: Direction) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    fn coordinator_handle() -> (CoordinatorHandle, crate::context::Context) {
        let cntx = crate::context::Context::new();
        (CoordinatorHandle::for_test(cntx.clone()), cntx)
    }

    fn entry_bytes(entries: &[crate::journal::Entry]) -> Vec<u8> {
        let mut buf = Vec::new();
        for e in entries {
            buf.extend_from_slice(&e.encode());
        }
        buf
    }

    #[tokio::test]
    async fn clean_finalization_keeps_latch_decremented_once() {
        use crate::journal::{Entry, Lsn};

        let entries = vec![
            Entry::command(0, 1, vec![Bytes::from_static(b"SET a 1")]),
            Entry::lsn_marker(0, Lsn(2)),
        ];
        let socket = Arc::new(FakeSocket::new(entry_bytes(&entries)));
        let latch = Arc::new(CountdownLatch::new(1));
        let (handle, _cntx) = coordinator_handle();
        let flow = Flow::new(0, latch.clone(), handle);
        let executor = Arc::new(RecordingExecutor {
            applied: Arc::new(AsyncMutex::new(Vec::new())),
            oom_after: None,
            count: AtomicU64::new(0),
        });

        flow.start(executor.clone(), socket).await;

        assert_eq!(flow.last_attempt(), Some(2));
        assert_eq!(latch.value(), 0);
        assert_eq!(*executor.applied.lock().await, vec!["SET a 1".to_string()]);
    }

    #[tokio::test]
    async fn oom_marks_coordinator_fatal_and_stops_flow() {
        use crate::journal::Entry;

        let entries = vec![
            Entry::command(0, 1, vec![Bytes::from_static(b"SET a 1")]),
            Entry::command(0, 2, vec![Bytes::from_static(b"SET b 2")]),
        ];
        let socket = Arc::new(FakeSocket::new(entry_bytes(&entries)));
        let latch = Arc::new(CountdownLatch::new(1));
        let (handle, _cntx) = coordinator_handle();
        let flow = Flow::new(0, latch.clone(), handle.clone());
        let executor = Arc::new(RecordingExecutor {
            applied: Arc::new(AsyncMutex::new(Vec::new())),
            oom_after: Some(1),
            count: AtomicU64::new(0),
        });

        flow.start(executor.clone(), socket).await;

        assert!(handle.is_fatal());
        assert_eq!(latch.value(), 0);
        assert_eq!(*executor.applied.lock().await, vec!["SET a 1".to_string()]);
    }

    #[tokio::test]
    async fn cancel_before_start_unblocks_latch() {
        let latch = Arc::new(CountdownLatch::new(1));
        let (handle, _cntx) = coordinator_handle();
        let flow = Flow::new(0, latch.clone(), handle);
        flow.cancel();
        assert_eq!(latch.value(), 0);
    }

    #[tokio::test]
    async fn fatal_observed_during_lookahead_decrements_latch_exactly_once() {
        use crate::journal::{Entry, Lsn};

        let entries = vec![
            Entry::lsn_marker(0, Lsn(2)),
            Entry::command(0, 1, vec![Bytes::from_static(b"SET a 1")]),
        ];
        let socket = Arc::new(FakeSocket::new(entry_bytes(&entries)));
        let latch = Arc::new(CountdownLatch::new(1));
        let (handle, _cntx) = coordinator_handle();
        handle.mark_fatal("fatal from elsewhere");
        let flow = Flow::new(0, latch.clone(), handle);
        let executor = Arc::new(RecordingExecutor {
            applied: Arc::new(AsyncMutex::new(Vec::new())),
            oom_after: None,
            count: AtomicU64::new(0),
        });

        flow.start(executor, socket).await;

        // The marker's own decrement must be the only one: a second,
        // unconditional decrement after the loop would drive this negative.
        assert_eq!(latch.value(), 0);
    }

    #[tokio::test]
    async fn error_past_quiescence_marker_is_reported_not_swallowed() {
        use crate::journal::{Entry, Lsn};

        let mut bytes = entry_bytes(&[Entry::lsn_marker(0, Lsn(2))]);
        // A truncated frame past the marker: not a clean close, so it must
        // surface as an error instead of finalizing silently.
        bytes.extend_from_slice(&[0xD6, 0x01, 0x00, 0x00]);
        let socket = Arc::new(FakeSocket::new(bytes));
        let latch = Arc::new(CountdownLatch::new(1));
        let (handle, _cntx) = coordinator_handle();
        let flow = Flow::new(0, latch.clone(), handle);
        let executor = Arc::new(RecordingExecutor {
            applied: Arc::new(AsyncMutex::new(Vec::new())),
            oom_after: None,
            count: AtomicU64::new(0),
        });

        flow.start(executor, socket).await;

        assert_eq!(latch.value(), 0);
        assert!(flow.context().has_error());
    }
}
