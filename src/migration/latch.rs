//! Countdown synchronization used to await quiescence across every flow in
//! a migration, mirroring the fan-in half of the teacher's parallel sync
//! manager (spawn N workers, drain their completions through one point).

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct CountdownLatch {
    count: Mutex<i64>,
    notify: Notify,
}

impl CountdownLatch {
    pub fn new(initial: i64) -> Self {
        Self {
            count: Mutex::new(initial),
            notify: Notify::new(),
        }
    }

    pub fn decrement(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        let reached_zero = *count <= 0;
        drop(count);
        if reached_zero {
            self.notify.notify_waiters();
        }
    }

    pub fn increment(&self) {
        *self.count.lock() += 1;
    }

    pub fn value(&self) -> i64 {
        *self.count.lock()
    }

    /// Wait up to `max_wait` for the count to reach zero. Returns whether it
    /// did. Callers enforcing a longer overall deadline call this repeatedly
    /// with a bounded per-iteration wait so cancellation stays responsive.
    pub async fn wait_zero(&self, max_wait: Duration) -> bool {
        tokio::time::timeout(max_wait, async {
            loop {
                if self.value() <= 0 {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn reaches_zero_after_matching_decrements() {
        let latch = Arc::new(CountdownLatch::new(3));
        for _ in 0..3 {
            latch.decrement();
        }
        assert!(latch.wait_zero(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn retry_rebalances_via_increment() {
        let latch = CountdownLatch::new(1);
        latch.decrement();
        assert_eq!(latch.value(), 0);
        latch.increment();
        assert_eq!(latch.value(), 1);
        latch.decrement();
        assert!(latch.wait_zero(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn times_out_when_never_reached() {
        let latch = CountdownLatch::new(1);
        assert!(!latch.wait_zero(Duration::from_millis(20)).await);
    }
}
