//! Per-thread journal state: LSN allocation, the ring buffer, the consumer
//! registry, and the flush-mode gate. Thread-confined by construction — no
//! internal locking.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use tracing::trace;

use super::entry::{Entry, Lsn};
use super::ring::RingBuffer;

pub type ConsumerId = u64;

/// Handle a consumer callback receives alongside each entry, letting it
/// unregister itself without re-entering the slice while it is still
/// being iterated.
pub struct FanoutContext<'a> {
    id: ConsumerId,
    pending_removal: &'a RefCell<Vec<ConsumerId>>,
}

impl<'a> FanoutContext<'a> {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Request that this consumer be unregistered once the current fanout
    /// pass finishes. Safe to call from inside the callback itself.
    pub fn unregister_self(&self) {
        self.pending_removal.borrow_mut().push(self.id);
    }
}

pub type ConsumerFn = dyn Fn(Lsn, &Bytes, &FanoutContext) + Send + Sync;

#[derive(Default)]
struct Registry {
    next_id: ConsumerId,
    consumers: IndexMap<ConsumerId, Arc<ConsumerFn>>,
}

impl Registry {
    fn register(&mut self, f: Arc<ConsumerFn>) -> ConsumerId {
        self.next_id += 1;
        let id = self.next_id;
        self.consumers.insert(id, f);
        id
    }

    fn unregister(&mut self, id: ConsumerId) {
        // shift_remove, not swap_remove, so the remaining entries keep their
        // registration order.
        self.consumers.shift_remove(&id);
    }

    /// IDs in registration order, the order fanout must observe.
    fn snapshot_ids(&self) -> Vec<ConsumerId> {
        self.consumers.keys().copied().collect()
    }

    fn get(&self, id: ConsumerId) -> Option<Arc<ConsumerFn>> {
        self.consumers.get(&id).cloned()
    }
}

/// Thread-local journal state.
pub struct Slice {
    initialized: bool,
    cur_lsn: Lsn,
    ring: RingBuffer,
    registry: Registry,
    flush_enabled: bool,
    backlog: VecDeque<(Lsn, Bytes)>,
}

impl Slice {
    pub fn new(ring_max_entries: usize, ring_max_bytes: usize) -> Self {
        Self {
            initialized: false,
            cur_lsn: Lsn(1),
            ring: RingBuffer::new(ring_max_entries, ring_max_bytes),
            registry: Registry::default(),
            flush_enabled: true,
            backlog: VecDeque::new(),
        }
    }

    /// Idempotent. Sets `cur_lsn` to 1 only the first time it's called.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.cur_lsn = Lsn(1);
        self.initialized = true;
    }

    pub fn cur_lsn(&self) -> Lsn {
        self.cur_lsn
    }

    /// Assign `entry.lsn`, serialize it, and either fan it out immediately
    /// (flush-mode enabled) or append it to the backlog (disabled).
    /// Returns the assigned LSN.
    pub fn add_log_record(&mut self, entry: &mut Entry) -> Lsn {
        let lsn = self.cur_lsn;
        self.cur_lsn = self.cur_lsn.next();
        entry.lsn = lsn;
        let bytes = entry.encode();

        if self.flush_enabled {
            self.deliver(lsn, bytes);
        } else {
            self.backlog.push_back((lsn, bytes));
        }

        lsn
    }

    /// Append to the ring and fan out to every registered consumer, in
    /// registration order, before returning.
    fn deliver(&mut self, lsn: Lsn, bytes: Bytes) {
        self.ring.append(lsn, bytes.clone());

        let ids = self.registry.snapshot_ids();
        let pending_removal = RefCell::new(Vec::new());
        for id in ids {
            if let Some(consumer) = self.registry.get(id) {
                let ctx = FanoutContext {
                    id,
                    pending_removal: &pending_removal,
                };
                consumer(lsn, &bytes, &ctx);
            }
        }
        for id in pending_removal.into_inner() {
            trace!(consumer_id = id, "consumer unregistered itself during fanout");
            self.registry.unregister(id);
        }
    }

    /// Register a consumer. It observes every subsequent entry, with no
    /// backfill from the ring.
    pub fn register_on_change(&mut self, consumer: Arc<ConsumerFn>) -> ConsumerId {
        self.registry.register(consumer)
    }

    pub fn unregister_on_change(&mut self, id: ConsumerId) {
        self.registry.unregister(id);
    }

    /// Toggle the flush gate. Disabling means "batch": subsequent entries
    /// are appended to the backlog instead of delivered. Enabling flushes
    /// the backlog, in order, before returning.
    pub fn set_flush_mode(&mut self, enabled: bool) {
        self.flush_enabled = enabled;
        if enabled {
            while let Some((lsn, bytes)) = self.backlog.pop_front() {
                self.deliver(lsn, bytes);
            }
        }
    }

    pub fn is_flush_mode(&self) -> bool {
        self.flush_enabled
    }

    pub fn is_lsn_in_buffer(&self, lsn: Lsn) -> bool {
        self.ring.contains(lsn)
    }

    pub fn get_entry(&self, lsn: Lsn) -> Option<Bytes> {
        self.ring.get(lsn)
    }

    pub fn ring_size(&self) -> usize {
        self.ring.size()
    }

    pub fn ring_bytes(&self) -> usize {
        self.ring.bytes()
    }

    /// Drop ring contents. Does NOT reset `cur_lsn` and does NOT touch
    /// consumers.
    pub fn reset_ring_buffer(&mut self) {
        self.ring.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn slice() -> Slice {
        let mut s = Slice::new(16, usize::MAX);
        s.init();
        s
    }

    #[test]
    fn lsn_monotonically_increases() {
        let mut s = slice();
        let mut last = Lsn(0);
        for _ in 0..5 {
            let mut e = Entry::command(0, 1, vec![]);
            let lsn = s.add_log_record(&mut e);
            assert!(lsn > last);
            last = lsn;
        }
    }

    #[test]
    fn reset_ring_buffer_does_not_reset_cur_lsn() {
        let mut s = slice();
        let mut e = Entry::command(0, 1, vec![]);
        s.add_log_record(&mut e);
        let before = s.cur_lsn();
        s.reset_ring_buffer();
        assert_eq!(s.cur_lsn(), before);
        assert_eq!(s.ring_size(), 0);
    }

    #[test]
    fn init_is_idempotent() {
        let mut s = Slice::new(16, usize::MAX);
        s.init();
        let mut e = Entry::command(0, 1, vec![]);
        s.add_log_record(&mut e);
        let lsn_before = s.cur_lsn();
        s.init();
        assert_eq!(s.cur_lsn(), lsn_before);
    }

    #[test]
    fn consumers_observe_entries_in_order() {
        let mut s = slice();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        s.register_on_change(Arc::new(move |lsn: Lsn, _b: &Bytes, _ctx: &FanoutContext| {
            seen2.lock().push(lsn);
        }));

        for _ in 0..3 {
            let mut e = Entry::command(0, 1, vec![]);
            s.add_log_record(&mut e);
        }

        let seen = seen.lock();
        assert_eq!(*seen, vec![Lsn(1), Lsn(2), Lsn(3)]);
    }

    #[test]
    fn registration_isolation_skips_earlier_entries() {
        let mut s = slice();
        let mut e = Entry::command(0, 1, vec![]);
        s.add_log_record(&mut e); // LSN 1, before registration

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        s.register_on_change(Arc::new(move |lsn: Lsn, _b: &Bytes, _ctx: &FanoutContext| {
            seen2.lock().push(lsn);
        }));

        let mut e = Entry::command(0, 1, vec![]);
        s.add_log_record(&mut e); // LSN 2, after registration

        assert_eq!(*seen.lock(), vec![Lsn(2)]);
    }

    #[test]
    fn consumer_can_unregister_itself_during_fanout() {
        let mut s = slice();
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let id_cell: Arc<parking_lot::Mutex<Option<ConsumerId>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let id_cell2 = id_cell.clone();

        let id = s.register_on_change(Arc::new(move |_lsn, _b, ctx: &FanoutContext| {
            calls2.fetch_add(1, Ordering::SeqCst);
            if let Some(expected) = *id_cell2.lock() {
                if expected == ctx.id() {
                    ctx.unregister_self();
                }
            }
        }));
        *id_cell.lock() = Some(id);

        for _ in 0..5 {
            let mut e = Entry::command(0, 1, vec![]);
            s.add_log_record(&mut e);
        }

        // Only observed the first entry before unregistering itself.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_mode_toggle_replays_backlog_in_order() {
        let mut s = slice();
        s.set_flush_mode(false);

        for _ in 0..3 {
            let mut e = Entry::command(0, 1, vec![]);
            s.add_log_record(&mut e);
        }

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        s.register_on_change(Arc::new(move |lsn: Lsn, _b: &Bytes, _ctx: &FanoutContext| {
            seen2.lock().push(lsn);
        }));

        assert!(seen.lock().is_empty());
        s.set_flush_mode(true);
        assert_eq!(*seen.lock(), vec![Lsn(1), Lsn(2), Lsn(3)]);
    }

    #[test]
    fn ring_still_records_with_zero_consumers() {
        let mut s = slice();
        let mut e = Entry::command(0, 1, vec![]);
        let lsn = s.add_log_record(&mut e);
        assert!(s.is_lsn_in_buffer(lsn));
    }

    #[test]
    fn evicted_lsn_is_not_in_buffer() {
        let mut s = Slice::new(2, usize::MAX);
        s.init();
        let mut lsns = vec![];
        for _ in 0..5 {
            let mut e = Entry::command(0, 1, vec![]);
            lsns.push(s.add_log_record(&mut e));
        }
        assert!(!s.is_lsn_in_buffer(lsns[0]));
        assert!(s.is_lsn_in_buffer(*lsns.last().unwrap()));
    }
}
