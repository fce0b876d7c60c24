use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Creates transactions and drives commit/abort, releasing every lock a
/// finished transaction still holds.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
        }
    }

    /// Begin a new transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.lock_manager.register_txn(txn.clone());
        txn
    }

    /// Commit: releases all locks and retires the transaction.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(TransactionError::InvalidState(txn.id()));
            }
            _ => {}
        }
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all_locks(txn);
        self.lock_manager.deregister_txn(txn.id());
        Ok(())
    }

    /// Abort: releases all locks and retires the transaction. Aborting a
    /// transaction the deadlock detector already marked ABORTED is the
    /// normal cleanup path, not an error.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn);
        self.lock_manager.deregister_txn(txn.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_manager() -> TransactionManager {
        TransactionManager::new(LockManager::new(Duration::from_millis(50)))
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let manager = test_manager();
        let t1 = manager.begin(IsolationLevel::RepeatableRead);
        let t2 = manager.begin(IsolationLevel::ReadCommitted);
        assert!(t2.id() > t1.id());
        assert_eq!(t1.state(), TransactionState::Growing);
    }

    #[test]
    fn test_commit_then_commit_again_fails() {
        let manager = test_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(manager.commit(&txn).is_err());
    }

    #[test]
    fn test_abort_marked_victim_is_ok() {
        let manager = test_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        txn.set_state(TransactionState::Aborted);
        manager.abort(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_commit_aborted_fails() {
        let manager = test_manager();
        let txn = manager.begin(IsolationLevel::ReadCommitted);
        txn.set_state(TransactionState::Aborted);
        assert!(manager.commit(&txn).is_err());
    }
}
