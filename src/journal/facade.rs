//! Process-wide handle wiring each thread's journal slice together. The
//! facade itself is the only journal object shared across threads; slices
//! are never touched off-thread.

use std::cell::RefCell;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::scheduler::SchedulerPool;

use super::entry::{Entry, Lsn};
use super::error::Error;
use super::slice::{ConsumerFn, ConsumerId, Slice};

thread_local! {
    static SLICE: RefCell<Option<Slice>> = RefCell::new(None);
}

fn with_slice<R>(f: impl FnOnce(&Slice) -> R) -> Option<R> {
    SLICE.with(|s| s.borrow().as_ref().map(f))
}

fn with_slice_mut<R>(f: impl FnOnce(&mut Slice) -> R) -> Option<R> {
    SLICE.with(|s| s.borrow_mut().as_mut().map(f))
}

/// Reset this thread's slice (ring only) and, when called as the per-thread
/// close callback, tear the slice down entirely.
fn reset_ring_on_this_thread() {
    with_slice_mut(|s| s.reset_ring_buffer());
}

fn teardown_this_thread() {
    SLICE.with(|s| *s.borrow_mut() = None);
}

/// Process-wide journal handle. Cheap to clone; all real state lives in
/// thread-local [`Slice`]s.
pub struct Facade {
    state_lock: AsyncMutex<()>,
}

impl Default for Facade {
    fn default() -> Self {
        Self::new()
    }
}

impl Facade {
    pub fn new() -> Self {
        Self {
            state_lock: AsyncMutex::new(()),
        }
    }

    /// Initialize the calling thread's slice. Idempotent.
    pub fn start_in_thread(&self) {
        let cfg = crate::config::config();
        SLICE.with(|s| {
            let mut guard = s.borrow_mut();
            if guard.is_none() {
                *guard = Some(Slice::new(
                    cfg.ring_buffer_max_entries,
                    cfg.ring_buffer_max_bytes,
                ));
            }
            guard.as_mut().unwrap().init();
        });
    }

    /// Under an exclusive state lock: reset this thread's ring, then
    /// dispatch a callback to every registered scheduler that tears down
    /// that thread's slice entirely. Returns once every callback has run.
    #[instrument(skip(self, pool))]
    pub async fn close<P: SchedulerPool>(&self, pool: &P) {
        let _guard = self.state_lock.lock().await;
        reset_ring_on_this_thread();
        pool.run_on_all(Arc::new(teardown_this_thread)).await;
    }

    /// Append `entry` to the calling thread's slice, assigning its LSN.
    pub fn record_entry(&self, entry: &mut Entry) -> Result<Lsn, Error> {
        with_slice_mut(|s| s.add_log_record(entry)).ok_or(Error::SliceNotInitialized)
    }

    pub fn register_on_change(&self, consumer: Arc<ConsumerFn>) -> Result<ConsumerId, Error> {
        with_slice_mut(|s| s.register_on_change(consumer)).ok_or(Error::SliceNotInitialized)
    }

    pub fn unregister_on_change(&self, id: ConsumerId) {
        with_slice_mut(|s| s.unregister_on_change(id));
    }

    pub fn set_flush_mode(&self, enabled: bool) {
        with_slice_mut(|s| s.set_flush_mode(enabled));
    }

    pub fn is_lsn_in_buffer(&self, lsn: Lsn) -> bool {
        with_slice(|s| s.is_lsn_in_buffer(lsn)).unwrap_or(false)
    }

    pub fn get_entry(&self, lsn: Lsn) -> Option<Bytes> {
        with_slice(|s| s.get_entry(lsn)).flatten()
    }

    pub fn lsn_buffer_size(&self) -> usize {
        with_slice(|s| s.ring_size()).unwrap_or(0)
    }

    pub fn cur_lsn(&self) -> Lsn {
        with_slice(|s| s.cur_lsn()).unwrap_or(Lsn::NONE)
    }

    pub fn reset_ring_buffer(&self) {
        with_slice_mut(|s| s.reset_ring_buffer());
    }
}
