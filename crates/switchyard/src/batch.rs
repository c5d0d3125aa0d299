//! Transactional batching.
//!
//! With batching on, the pump drains requests inside one shared transaction
//! instead of one per request. The transaction commits once the batch is
//! full or half its timeout has passed, and only when no call enlisted in it
//! is still running. A failed call dooms the whole batch.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchyard_core::{IsolationLevel, Scheduler, Transaction, TransactionManager};

struct Batch {
    transaction: Transaction,
    started: Instant,
    enlisted: usize,
    outstanding: usize,
    failed: bool,
    /// Resolve as soon as the last outstanding call completes.
    flush_pending: bool,
}

impl Batch {
    fn id(&self) -> u64 {
        self.transaction.id()
    }

    fn ready(&self, max_size: usize, timeout: Duration) -> bool {
        self.outstanding == 0
            && (self.failed
                || self.flush_pending
                || self.enlisted >= max_size
                || self.started.elapsed() >= timeout / 2)
    }

    fn doom(&mut self) {
        self.failed = true;
        self.transaction.set_rollback_only();
    }
}

struct BatchState {
    current: Option<Batch>,
    /// Full batches that stopped taking calls and wait for their last ones.
    draining: Vec<Batch>,
}

impl BatchState {
    fn find(&mut self, id: u64) -> Option<&mut Batch> {
        if let Some(batch) = self.current.as_mut().filter(|b| b.id() == id) {
            return Some(batch);
        }
        self.draining.iter_mut().find(|b| b.id() == id)
    }

    fn remove(&mut self, id: u64) -> Option<Batch> {
        if self.current.as_ref().is_some_and(|b| b.id() == id) {
            return self.current.take();
        }
        let index = self.draining.iter().position(|b| b.id() == id)?;
        Some(self.draining.swap_remove(index))
    }
}

/// One transaction shared by every pump draining a channel.
pub struct SharedTransactedBatch {
    manager: Arc<dyn TransactionManager>,
    max_size: usize,
    timeout: Duration,
    scheduler: Scheduler,
    state: Mutex<BatchState>,
    this: Weak<SharedTransactedBatch>,
}

impl SharedTransactedBatch {
    pub fn new(
        manager: Arc<dyn TransactionManager>,
        max_size: usize,
        timeout: Duration,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            manager,
            max_size: max_size.max(1),
            timeout,
            scheduler,
            state: Mutex::new(BatchState {
                current: None,
                draining: Vec::new(),
            }),
            this: this.clone(),
        })
    }

    /// The current batch transaction, starting a new batch if needed.
    pub fn transaction(&self) -> Transaction {
        let mut state = self.state.lock();
        self.current(&mut state).transaction.clone()
    }

    /// Join the current batch, or a fresh one when it is full. Every enlist
    /// is matched by one [`complete`](Self::complete) with the transaction
    /// it returned.
    pub fn enlist(&self) -> Transaction {
        let mut state = self.state.lock();
        let batch = self.current(&mut state);
        batch.enlisted += 1;
        batch.outstanding += 1;
        batch.transaction.clone()
    }

    /// A call enlisted in `transaction`'s batch finished.
    pub fn complete(&self, transaction: &Transaction, failed: bool) {
        let id = transaction.id();
        let resolved = {
            let mut state = self.state.lock();
            let Some(batch) = state.find(id).filter(|b| b.outstanding > 0) else {
                tracing::warn!(transaction_id = id, "batch completion without a matching enlist");
                return;
            };
            batch.outstanding -= 1;
            if failed {
                batch.doom();
            }
            if batch.ready(self.max_size, self.timeout) {
                state.remove(id)
            } else {
                None
            }
        };
        if let Some(batch) = resolved {
            Self::resolve(batch);
        }
    }

    /// Resolve the current batch now, or as soon as its running calls
    /// finish.
    pub fn flush(&self) {
        let resolved = {
            let mut state = self.state.lock();
            let Some(batch) = state.current.as_mut() else {
                return;
            };
            if batch.outstanding > 0 {
                batch.flush_pending = true;
                None
            } else {
                state.current.take()
            }
        };
        if let Some(batch) = resolved {
            Self::resolve(batch);
        }
    }

    /// Doom every open batch; each rolls back once its running calls finish.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            let BatchState { current, draining } = &mut *state;
            for batch in current.iter_mut().chain(draining.iter_mut()) {
                batch.doom();
            }
        }
        self.flush();
    }

    /// Calls enlisted in the current batch, finished or not.
    pub fn enlisted(&self) -> usize {
        self.state.lock().current.as_ref().map_or(0, |b| b.enlisted)
    }

    /// Full batches still waiting on running calls.
    pub fn draining(&self) -> usize {
        self.state.lock().draining.len()
    }

    /// The batch new calls join. A full one is retired first.
    fn current<'a>(&self, state: &'a mut BatchState) -> &'a mut Batch {
        if state
            .current
            .as_ref()
            .is_some_and(|b| b.enlisted >= self.max_size)
        {
            if let Some(full) = state.current.take() {
                tracing::debug!(
                    transaction_id = full.id(),
                    outstanding = full.outstanding,
                    "transaction batch full; starting another"
                );
                state.draining.push(full);
            }
        }
        state.current.get_or_insert_with(|| self.start())
    }

    fn start(&self) -> Batch {
        let transaction = self
            .manager
            .create(IsolationLevel::default(), self.timeout);
        tracing::debug!(transaction_id = transaction.id(), "transaction batch started");

        let this = self.this.clone();
        let id = transaction.id();
        drop(self.scheduler.after(self.timeout / 2, move || {
            if let Some(batch) = this.upgrade() {
                batch.flush_stale(id);
            }
        }));
        Batch {
            transaction,
            started: Instant::now(),
            enlisted: 0,
            outstanding: 0,
            failed: false,
            flush_pending: false,
        }
    }

    fn flush_stale(&self, id: u64) {
        let current = self
            .state
            .lock()
            .current
            .as_ref()
            .is_some_and(|b| b.id() == id);
        if current {
            tracing::debug!(transaction_id = id, "transaction batch timed out; flushing");
            self.flush();
        }
    }

    fn resolve(batch: Batch) {
        let Batch {
            transaction,
            enlisted: size,
            failed,
            ..
        } = batch;
        if failed {
            transaction.rollback();
            tracing::debug!(transaction_id = transaction.id(), size, "transaction batch rolled back");
            return;
        }
        match transaction.commit() {
            Ok(()) => {
                tracing::debug!(transaction_id = transaction.id(), size, "transaction batch committed")
            }
            Err(error) => tracing::warn!(
                transaction_id = transaction.id(),
                size,
                %error,
                "transaction batch failed to commit"
            ),
        }
    }
}

impl std::fmt::Debug for SharedTransactedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedTransactedBatch")
            .field("max_size", &self.max_size)
            .field("enlisted", &state.current.as_ref().map_or(0, |b| b.enlisted))
            .field("draining", &state.draining.len())
            .finish()
    }
}
