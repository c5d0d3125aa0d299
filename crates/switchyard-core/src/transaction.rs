//! Transactions and the ambient transaction scope.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::DispatchError;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    Snapshot,
}

type Enlistment = Box<dyn FnOnce(TransactionStatus) + Send>;

struct TxState {
    status: TransactionStatus,
    rollback_only: bool,
    enlistments: Vec<Enlistment>,
}

struct TxInner {
    id: u64,
    isolation: IsolationLevel,
    deadline: Instant,
    state: Mutex<TxState>,
}

/// A shared handle to one transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    pub fn new(isolation: IsolationLevel, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(TxInner {
                id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
                isolation,
                deadline: now.checked_add(timeout).unwrap_or(now + Duration::from_secs(86_400)),
                state: Mutex::new(TxState {
                    status: TransactionStatus::Active,
                    rollback_only: false,
                    enlistments: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.inner.deadline
    }

    /// Time left before the transaction times out.
    pub fn remaining(&self) -> Duration {
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    /// Vote to abort; a later commit rolls back instead.
    pub fn set_rollback_only(&self) {
        self.inner.state.lock().rollback_only = true;
    }

    /// Run `f` with the final outcome. Runs immediately if already resolved.
    pub fn on_outcome(&self, f: impl FnOnce(TransactionStatus) + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.status == TransactionStatus::Active {
            state.enlistments.push(Box::new(f));
            return;
        }
        let status = state.status;
        drop(state);
        f(status);
    }

    /// Commit unless a rollback was voted or the deadline passed.
    pub fn commit(&self) -> Result<(), DispatchError> {
        let expired = self.is_expired();
        let rollback_only = self.inner.state.lock().rollback_only;
        if rollback_only || expired {
            self.resolve(TransactionStatus::Aborted);
            let why = if expired { "timed out" } else { "marked rollback-only" };
            return Err(DispatchError::Transaction(format!(
                "transaction {} {why}; rolled back",
                self.id()
            )));
        }
        match self.resolve(TransactionStatus::Committed) {
            TransactionStatus::Committed => Ok(()),
            other => Err(DispatchError::Transaction(format!(
                "transaction {} already {other:?}",
                self.id()
            ))),
        }
    }

    pub fn rollback(&self) {
        self.resolve(TransactionStatus::Aborted);
    }

    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The transaction installed by the innermost [`TransactionScope`].
    pub fn current() -> Option<Transaction> {
        AMBIENT.with(|ambient| ambient.borrow().clone())
    }

    fn resolve(&self, outcome: TransactionStatus) -> TransactionStatus {
        let enlistments = {
            let mut state = self.inner.state.lock();
            if state.status != TransactionStatus::Active {
                return state.status;
            }
            state.status = outcome;
            std::mem::take(&mut state.enlistments)
        };
        tracing::debug!(transaction_id = self.id(), ?outcome, "transaction resolved");
        for enlistment in enlistments {
            enlistment(outcome);
        }
        outcome
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// Creates and attaches transactions for the dispatcher.
pub trait TransactionManager: Send + Sync {
    fn create(&self, isolation: IsolationLevel, timeout: Duration) -> Transaction;

    /// Accept a transaction flowed in with a message.
    fn attach(&self, flowed: &Transaction) -> Result<Transaction, DispatchError> {
        if flowed.is_active() {
            Ok(flowed.clone())
        } else {
            Err(DispatchError::Transaction(format!(
                "flowed transaction {} is no longer active",
                flowed.id()
            )))
        }
    }
}

/// In-process transactions with no external resource managers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransactionManager;

impl TransactionManager for LocalTransactionManager {
    fn create(&self, isolation: IsolationLevel, timeout: Duration) -> Transaction {
        Transaction::new(isolation, timeout)
    }
}

thread_local! {
    static AMBIENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
}

/// Installs an ambient transaction for the current thread and restores the
/// previous one when dropped.
#[must_use = "the scope is uninstalled when dropped"]
pub struct TransactionScope {
    previous: Option<Transaction>,
}

impl TransactionScope {
    pub fn enter(transaction: Option<Transaction>) -> Self {
        let previous = AMBIENT.with(|ambient| ambient.replace(transaction));
        Self { previous }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        AMBIENT.with(|ambient| {
            ambient.replace(previous);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_vote_wins_over_commit() {
        let tx = LocalTransactionManager.create(IsolationLevel::default(), Duration::from_secs(5));
        tx.set_rollback_only();
        assert!(tx.commit().is_err());
        assert_eq!(tx.status(), TransactionStatus::Aborted);
    }

    #[test]
    fn enlistments_see_the_outcome_once() {
        let tx = Transaction::new(IsolationLevel::ReadCommitted, Duration::from_secs(5));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tx.on_outcome(move |status| sink.lock().push(status));
        tx.commit().unwrap();
        tx.rollback();
        assert_eq!(seen.lock().as_slice(), [TransactionStatus::Committed]);
    }

    #[test]
    fn scopes_nest_and_restore() {
        let outer = Transaction::new(IsolationLevel::default(), Duration::from_secs(5));
        let inner = Transaction::new(IsolationLevel::default(), Duration::from_secs(5));
        assert!(Transaction::current().is_none());
        {
            let _outer = TransactionScope::enter(Some(outer.clone()));
            {
                let _inner = TransactionScope::enter(Some(inner.clone()));
                assert!(Transaction::current().unwrap().ptr_eq(&inner));
            }
            assert!(Transaction::current().unwrap().ptr_eq(&outer));
        }
        assert!(Transaction::current().is_none());
    }
}
