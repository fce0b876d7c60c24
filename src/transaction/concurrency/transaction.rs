use std::collections::{HashMap, HashSet};
use std::fmt;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states. A transaction starts GROWING; releasing a
/// read/write lock moves it to SHRINKING per its isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    TableLockNotPresent,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeUnlockingRows,
    AttemptedIntentionLockOnRow,
    Deadlock,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under READ_UNCOMMITTED"
            }
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "illegal lock upgrade",
            AbortReason::TableLockNotPresent => "row lock without a covering table lock",
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock without a held lock",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked while row locks remain"
            }
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::Deadlock => "chosen as deadlock victim",
        };
        f.write_str(message)
    }
}

/// Errors surfaced by the lock manager and transaction manager.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {txn_id} aborted: {reason}")]
    Aborted { txn_id: TxnId, reason: AbortReason },

    #[error("transaction {0} not found")]
    NotFound(TxnId),

    #[error("transaction {0} is already committed or aborted")]
    InvalidState(TxnId),
}

#[derive(Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<Rid>>,
    exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

/// A database transaction: identity, isolation level, 2PL phase, and the
/// lock sets maintained on its behalf by the lock manager.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    locks: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// The table-level lock this transaction holds on `oid`, if any.
    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        let locks = self.locks.lock();
        if locks.exclusive_tables.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if locks.shared_intention_exclusive_tables.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else if locks.shared_tables.contains(&oid) {
            Some(LockMode::Shared)
        } else if locks.intention_exclusive_tables.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if locks.intention_shared_tables.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else {
            None
        }
    }

    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks.shared_rows.get(&oid).is_some_and(|s| !s.is_empty())
            || locks.exclusive_rows.get(&oid).is_some_and(|s| !s.is_empty())
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().table_set(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().table_set(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock();
        let rows = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("row locks are only S or X"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock();
        let rows = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("row locks are only S or X"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    /// Drain every held table lock, for release at commit/abort.
    pub(crate) fn take_table_locks(&self) -> Vec<(LockMode, TableOid)> {
        let mut guard = self.locks.lock();
        let locks = &mut *guard;
        let mut held = Vec::new();
        for (mode, set) in [
            (LockMode::IntentionShared, &mut locks.intention_shared_tables),
            (LockMode::IntentionExclusive, &mut locks.intention_exclusive_tables),
            (LockMode::Shared, &mut locks.shared_tables),
            (
                LockMode::SharedIntentionExclusive,
                &mut locks.shared_intention_exclusive_tables,
            ),
            (LockMode::Exclusive, &mut locks.exclusive_tables),
        ] {
            held.extend(set.drain().map(|oid| (mode, oid)));
        }
        held
    }

    /// Drain every held row lock, for release at commit/abort.
    pub(crate) fn take_row_locks(&self) -> Vec<(LockMode, TableOid, Rid)> {
        let mut guard = self.locks.lock();
        let locks = &mut *guard;
        let mut held = Vec::new();
        for (mode, rows) in [
            (LockMode::Shared, &mut locks.shared_rows),
            (LockMode::Exclusive, &mut locks.exclusive_rows),
        ] {
            for (oid, rids) in rows.drain() {
                held.extend(rids.into_iter().map(|rid| (mode, oid, rid)));
            }
        }
        held
    }
}
