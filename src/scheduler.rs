//! The scheduler-pool seam the journal facade depends on to reach every
//! thread's slice. The actual proactor/fiber scheduler is out of scope for
//! this crate (see spec §1); this module defines the trait the facade needs
//! plus one reference implementation used by the tests and suitable as a
//! starting point for an embedder that has no proactor pool of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub type ThreadId = u64;

/// "Run this closure on every scheduler and await completion" — the one
/// cross-thread dependency the journal facade has (see spec §6, "Shard-set
/// contract").
#[async_trait]
pub trait SchedulerPool: Send + Sync {
    async fn run_on_all(&self, f: Arc<dyn Fn() + Send + Sync>);
}

pub struct Job {
    run: Arc<dyn Fn() + Send + Sync>,
    ack: oneshot::Sender<()>,
}

/// Reference scheduler pool: each participating OS thread registers itself
/// and then drains its own channel in a loop (its "scheduler"). Dispatch
/// sends a job to every registered thread and awaits an ack from each.
#[derive(Default)]
pub struct ThreadRegistryPool {
    threads: Mutex<HashMap<ThreadId, Sender<Job>>>,
    next_id: AtomicU64,
}

impl ThreadRegistryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread. Returns the channel it must drain
    /// (e.g. via [`drive_forever`]) to actually execute dispatched jobs.
    pub fn register(&self) -> (ThreadId, Receiver<Job>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = channel();
        self.threads.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

#[async_trait]
impl SchedulerPool for ThreadRegistryPool {
    async fn run_on_all(&self, f: Arc<dyn Fn() + Send + Sync>) {
        let senders: Vec<Sender<Job>> = self.threads.lock().values().cloned().collect();
        let mut acks = Vec::with_capacity(senders.len());

        for tx in senders {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx
                .send(Job {
                    run: f.clone(),
                    ack: ack_tx,
                })
                .is_ok()
            {
                acks.push(ack_rx);
            }
        }

        for ack in acks {
            let _ = ack.await;
        }
    }
}

/// Drain `rx` until its sender is dropped, running each job and
/// acknowledging it. Intended to run as the body of a dedicated OS thread.
pub fn drive_forever(rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        (job.run)();
        let _ = job.ack.send(());
    }
}
