//! Per-migration state machine orchestrating one [`Flow`] per source shard.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::context::Context;
use crate::executor::Executor;
use crate::socket::JournalSocket;

use super::error::Error as MigrationError;
use super::flow::Flow;
use super::latch::CountdownLatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Sync,
    Finished,
    Fatal,
}

/// What a flow needs back from its coordinator: whether it has gone fatal,
/// and somewhere to report errors that aren't its own to raise.
#[derive(Clone)]
pub(crate) struct CoordinatorHandle {
    state: Arc<Mutex<State>>,
    cntx: Context,
}

impl CoordinatorHandle {
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(*self.state.lock(), State::Fatal)
    }

    pub(crate) fn mark_fatal(&self, err: impl std::fmt::Display) {
        *self.state.lock() = State::Fatal;
        self.cntx.report_error(err);
    }

    pub(crate) fn report_error(&self, err: impl std::fmt::Display) {
        self.cntx.report_error(err);
    }

    #[cfg(test)]
    pub(crate) fn for_test(cntx: Context) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Sync)),
            cntx,
        }
    }
}

/// Counts keys owned by the slots this migration is receiving. The actual
/// slot-ownership catalog is out of scope for this crate; the coordinator
/// only caches whatever the embedder's callback reports.
pub type KeyCounter = Arc<dyn Fn() -> u64 + Send + Sync>;

pub struct Coordinator {
    state: Arc<Mutex<State>>,
    cntx: Mutex<Context>,
    latch: Mutex<Option<Arc<CountdownLatch>>>,
    flows: Mutex<Vec<Arc<Flow>>>,
    keys_number: Mutex<Option<u64>>,
    executor: Arc<dyn Executor>,
    key_counter: KeyCounter,
}

impl Coordinator {
    pub fn new(executor: Arc<dyn Executor>, key_counter: KeyCounter) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Connecting)),
            cntx: Mutex::new(Context::new()),
            latch: Mutex::new(None),
            flows: Mutex::new(Vec::new()),
            keys_number: Mutex::new(None),
            executor,
            key_counter,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            state: self.state.clone(),
            cntx: self.cntx.lock().clone(),
        }
    }

    /// Reset state and create `n_shards` flows, one per source shard index.
    #[instrument(skip(self))]
    pub fn init(&self, n_shards: usize) {
        *self.cntx.lock() = Context::new();
        *self.state.lock() = State::Sync;
        *self.keys_number.lock() = None;

        let latch = Arc::new(CountdownLatch::new(n_shards as i64));
        *self.latch.lock() = Some(latch.clone());

        let handle = self.handle();
        let flows = (0..n_shards)
            .map(|idx| Arc::new(Flow::new(idx, latch.clone(), handle.clone())))
            .collect();
        *self.flows.lock() = flows;
        info!(n_shards, "migration initialized");
    }

    pub fn flow(&self, source_shard_id: usize) -> Option<Arc<Flow>> {
        self.flows.lock().get(source_shard_id).cloned()
    }

    /// Drain `socket` through the flow for `source_shard_id`. If the flow
    /// drives the coordinator fatal, stops every other flow before returning.
    #[instrument(skip(self, socket))]
    pub async fn start_flow(&self, source_shard_id: usize, socket: Arc<dyn JournalSocket>) {
        let Some(flow) = self.flow(source_shard_id) else {
            warn!(source_shard_id, "start_flow called for unknown source shard");
            return;
        };
        flow.start(self.executor.clone(), socket).await;
        if self.state() == State::Fatal {
            self.stop().await;
        }
    }

    pub fn pause(&self, paused: bool) {
        for flow in self.flows.lock().iter() {
            flow.set_pause(paused);
        }
    }

    /// Wait for every flow to report `last_attempt == attempt` at the
    /// moment the latch reads zero. Returns false on fatal or timeout.
    #[instrument(skip(self))]
    pub async fn join(&self, attempt: u64) -> bool {
        let cfg = crate::config::config();
        let deadline = Instant::now() + cfg.finalization_timeout();
        let poll = cfg.pause_poll_interval();

        let latch = match self.latch.lock().clone() {
            Some(l) => l,
            None => return false,
        };

        loop {
            if self.state() == State::Fatal {
                return false;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.cntx.lock().report_error(&MigrationError::FinalizationTimeout);
                warn!(attempt, "join timed out waiting for flows to quiesce");
                return false;
            }

            let step = remaining.min(poll);
            if !latch.wait_zero(step).await {
                continue;
            }

            if self.attempts_match(attempt) {
                *self.state.lock() = State::Finished;
                *self.keys_number.lock() = Some((self.key_counter)());
                info!(attempt, "migration finalized");
                return true;
            }

            // Latch is at zero but some flow quiesced at a different LSN;
            // this attempt is stale. Sleep rather than spin while we wait
            // for a retry to rebalance the latch.
            tokio::time::sleep(step).await;
        }
    }

    fn attempts_match(&self, attempt: u64) -> bool {
        let flows = self.flows.lock();
        !flows.is_empty() && flows.iter().all(|f| f.last_attempt() == Some(attempt))
    }

    /// Cancel every flow and, unless already fatal, wait for them to
    /// quiesce before returning.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.cntx.lock().cancel();
        let flows = self.flows.lock().clone();
        for flow in &flows {
            flow.cancel();
        }

        if self.state() == State::Fatal {
            return;
        }

        let cfg = crate::config::config();
        if let Some(latch) = self.latch.lock().clone() {
            if !latch.wait_zero(cfg.finalization_timeout()).await {
                warn!("stop() timed out waiting for flows to quiesce");
            }
        }
    }

    pub fn get_key_count(&self) -> u64 {
        if self.state() == State::Finished {
            if let Some(n) = *self.keys_number.lock() {
                return n;
            }
        }
        (self.key_counter)()
    }
}
