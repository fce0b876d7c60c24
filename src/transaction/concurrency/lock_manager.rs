use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use parking_lot::{Condvar, Mutex};
use log::{debug, warn};

use crate::common::types::{Rid, TableOid, TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};
use crate::transaction::concurrency::wait_for_graph::WaitForGraph;

/// Hierarchical lock modes. Intention modes are table-only placeholders
/// announcing finer-grained locks underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The multi-granularity compatibility matrix.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Legal in-place upgrades: IS -> {S, X, IX, SIX}; S -> {X, SIX};
    /// IX -> {X, SIX}; SIX -> X.
    pub fn can_upgrade_to(self, target: LockMode) -> bool {
        use LockMode::*;
        match (self, target) {
            (IntentionShared, Shared)
            | (IntentionShared, Exclusive)
            | (IntentionShared, IntentionExclusive)
            | (IntentionShared, SharedIntentionExclusive)
            | (Shared, Exclusive)
            | (Shared, SharedIntentionExclusive)
            | (IntentionExclusive, Exclusive)
            | (IntentionExclusive, SharedIntentionExclusive)
            | (SharedIntentionExclusive, Exclusive) => true,
            _ => false,
        }
    }
}

/// The object a lock request names.
#[derive(Debug, Clone, Copy)]
enum LockTarget {
    Table(TableOid),
    Row(TableOid, Rid),
}

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct QueueState {
    requests: Vec<LockRequest>,
    /// Transaction currently upgrading in place, or `INVALID_TXN_ID`. At
    /// most one upgrade may be in flight per queue.
    upgrading: TxnId,
}

struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: Vec::new(),
                upgrading: INVALID_TXN_ID,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Process-wide two-phase-locking lock manager with table and row
/// granularity, FIFO queues, and background wait-for-graph deadlock
/// detection.
///
/// Latch order: map latch before queue latch, never both map latches at
/// once. Queue condition variables carry all waiting.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<(TableOid, Rid), Arc<LockRequestQueue>>>,
    /// Live transactions, registered by the transaction manager. The
    /// deadlock detector aborts victims through this registry.
    active_txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Create the lock manager and start its deadlock detection worker,
    /// which wakes every `cycle_detection_interval`.
    pub fn new(cycle_detection_interval: Duration) -> Arc<Self> {
        let lock_manager = Arc::new(Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            active_txns: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            detector: Mutex::new(None),
        });

        let weak = Arc::downgrade(&lock_manager);
        let handle = thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || loop {
                let Some(lock_manager) = weak.upgrade() else {
                    break;
                };
                {
                    let mut stop = lock_manager.shutdown.lock();
                    if !*stop {
                        lock_manager
                            .shutdown_cv
                            .wait_for(&mut stop, cycle_detection_interval);
                    }
                    if *stop {
                        break;
                    }
                }
                lock_manager.run_cycle_detection();
            })
            .expect("failed to spawn deadlock detector");
        *lock_manager.detector.lock() = Some(handle);

        lock_manager
    }

    /// Acquire (or upgrade to) a table lock. Returns false if the
    /// transaction was aborted while waiting; raises on 2PL violations.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionError> {
        self.validate_acquire(txn, mode, LockTarget::Table(oid))?;
        let queue = self.table_queue(oid);
        self.acquire(txn, mode, &queue, LockTarget::Table(oid))
    }

    /// Acquire (or upgrade to) a row lock. Only S and X are legal, and the
    /// covering table intention lock must already be held.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        self.validate_acquire(txn, mode, LockTarget::Row(oid, rid))?;
        let queue = self.row_queue(oid, rid);
        self.acquire(txn, mode, &queue, LockTarget::Row(oid, rid))
    }

    /// Release a table lock, transitioning the 2PL phase as required.
    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
    ) -> Result<(), TransactionError> {
        let queue = {
            let map = self.table_lock_map.lock();
            map.get(&oid).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = {
            let mut state = queue.state.lock();
            let Some(position) = state
                .requests
                .iter()
                .position(|r| r.txn_id == txn.id() && r.granted)
            else {
                return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            };
            if txn.holds_row_locks_on(oid) {
                return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
            }
            let mode = state.requests[position].mode;
            state.requests.remove(position);
            mode
        };
        queue.cv.notify_all();

        txn.remove_table_lock(mode, oid);
        self.transition_on_unlock(txn, mode);
        Ok(())
    }

    /// Release a row lock, transitioning the 2PL phase as required.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionError> {
        let queue = {
            let map = self.row_lock_map.lock();
            map.get(&(oid, rid)).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = {
            let mut state = queue.state.lock();
            let Some(position) = state
                .requests
                .iter()
                .position(|r| r.txn_id == txn.id() && r.granted)
            else {
                return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            };
            let mode = state.requests[position].mode;
            state.requests.remove(position);
            mode
        };
        queue.cv.notify_all();

        txn.remove_row_lock(mode, oid, rid);
        self.transition_on_unlock(txn, mode);
        Ok(())
    }

    /// Drop every lock the transaction still holds, rows before tables,
    /// bypassing 2PL phase checks. Called at commit and abort.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        for (_, oid, rid) in txn.take_row_locks() {
            let queue = {
                let map = self.row_lock_map.lock();
                map.get(&(oid, rid)).cloned()
            };
            if let Some(queue) = queue {
                self.remove_requests_of(&queue, txn.id());
            }
        }
        for (_, oid) in txn.take_table_locks() {
            let queue = {
                let map = self.table_lock_map.lock();
                map.get(&oid).cloned()
            };
            if let Some(queue) = queue {
                self.remove_requests_of(&queue, txn.id());
            }
        }
    }

    pub(crate) fn register_txn(&self, txn: Arc<Transaction>) {
        self.active_txns.lock().insert(txn.id(), txn);
    }

    pub(crate) fn deregister_txn(&self, txn_id: TxnId) {
        self.active_txns.lock().remove(&txn_id);
    }

    /// One full detection pass: rebuild the wait-for graph and abort the
    /// youngest member of each cycle until none remain. Also runs in the
    /// background worker; exposed for deterministic tests.
    pub fn run_cycle_detection(&self) {
        loop {
            let graph = self.build_wait_for_graph();
            if graph.is_empty() {
                return;
            }
            let Some(cycle) = graph.find_cycle() else {
                return;
            };
            let victim = *cycle.iter().max().unwrap();
            warn!("deadlock cycle {:?}, aborting youngest transaction {}", cycle, victim);

            let txn = self.active_txns.lock().get(&victim).cloned();
            let Some(txn) = txn else {
                // victim finished in the meantime; the graph is stale
                return;
            };
            txn.set_state(TransactionState::Aborted);
            self.notify_all_queues();
        }
    }

    fn build_wait_for_graph(&self) -> WaitForGraph {
        let aborted: HashSet<TxnId> = {
            let txns = self.active_txns.lock();
            txns.iter()
                .filter(|(_, t)| t.state() == TransactionState::Aborted)
                .map(|(&id, _)| id)
                .collect()
        };

        let mut queues: Vec<Arc<LockRequestQueue>> = Vec::new();
        queues.extend(self.table_lock_map.lock().values().cloned());
        queues.extend(self.row_lock_map.lock().values().cloned());

        let mut graph = WaitForGraph::new();
        for queue in queues {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                if aborted.contains(&waiter.txn_id) {
                    continue;
                }
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if holder.txn_id != waiter.txn_id
                        && !holder.mode.compatible_with(waiter.mode)
                    {
                        graph.add_edge(waiter.txn_id, holder.txn_id);
                    }
                }
            }
        }
        graph
    }

    fn notify_all_queues(&self) {
        let mut queues: Vec<Arc<LockRequestQueue>> = Vec::new();
        queues.extend(self.table_lock_map.lock().values().cloned());
        queues.extend(self.row_lock_map.lock().values().cloned());
        for queue in queues {
            queue.cv.notify_all();
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        map.entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    fn row_queue(&self, oid: TableOid, rid: Rid) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        map.entry((oid, rid))
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    /// 2PL admission rules checked before a request enters a queue. A
    /// violation flips the transaction to ABORTED and raises.
    fn validate_acquire(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        target: LockTarget,
    ) -> Result<(), TransactionError> {
        use LockMode::*;

        if matches!(target, LockTarget::Row(..)) && !matches!(mode, Shared | Exclusive) {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }

        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, IntentionShared | Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }

        // Row locks require a covering table lock already held.
        if let LockTarget::Row(oid, _) = target {
            let table_mode = txn.table_lock_mode(oid);
            let covered = match mode {
                Exclusive => matches!(
                    table_mode,
                    Some(IntentionExclusive) | Some(SharedIntentionExclusive) | Some(Exclusive)
                ),
                _ => table_mode.is_some(),
            };
            if !covered {
                return Err(self.abort(txn, AbortReason::TableLockNotPresent));
            }
        }
        Ok(())
    }

    /// Queue a request (new or upgrade) and block until granted or aborted.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        queue: &Arc<LockRequestQueue>,
        target: LockTarget,
    ) -> Result<bool, TransactionError> {
        let mut state = queue.state.lock();

        if let Some(position) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        {
            let held = state.requests[position];
            if held.mode == mode {
                return Ok(true);
            }
            if state.upgrading != INVALID_TXN_ID {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !held.mode.can_upgrade_to(mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }

            // Upgrade: drop the held lock and re-queue ahead of every
            // waiter, marked so no one else may upgrade concurrently.
            state.requests.remove(position);
            self.remove_from_lock_sets(txn, held.mode, target);
            state.upgrading = txn.id();
            let insert_at = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                insert_at,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    granted: false,
                },
            );
        } else {
            state.requests.push(LockRequest {
                txn_id: txn.id(),
                mode,
                granted: false,
            });
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                // Deadlock victim (or aborted elsewhere): withdraw and leave.
                if let Some(position) = state
                    .requests
                    .iter()
                    .position(|r| r.txn_id == txn.id() && !r.granted)
                {
                    state.requests.remove(position);
                }
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TXN_ID;
                }
                queue.cv.notify_all();
                debug!("transaction {} abandoned its lock request", txn.id());
                return Ok(false);
            }
            if Self::grantable(&state, txn.id()) {
                break;
            }
            queue.cv.wait(&mut state);
        }

        let position = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
            .expect("request vanished while waiting");
        state.requests[position].granted = true;
        if state.upgrading == txn.id() {
            state.upgrading = INVALID_TXN_ID;
        }
        self.add_to_lock_sets(txn, mode, target);
        // Waiters behind this request re-check their predicate: a grant may
        // make the next compatible request grantable.
        queue.cv.notify_all();
        Ok(true)
    }

    /// A request is grantable iff everything queued ahead of it is granted
    /// and compatible, and no other transaction holds the upgrade slot.
    /// Strict FIFO: one incompatible waiter blocks everyone behind it.
    fn grantable(state: &QueueState, txn_id: TxnId) -> bool {
        if state.upgrading != INVALID_TXN_ID && state.upgrading != txn_id {
            return false;
        }
        let mut mode = None;
        for request in &state.requests {
            if request.txn_id == txn_id {
                mode = Some(request.mode);
                break;
            }
        }
        let mode = mode.expect("request not queued");
        for request in &state.requests {
            if request.txn_id == txn_id {
                return true;
            }
            if !request.granted || !request.mode.compatible_with(mode) {
                return false;
            }
        }
        true
    }

    fn add_to_lock_sets(&self, txn: &Arc<Transaction>, mode: LockMode, target: LockTarget) {
        match target {
            LockTarget::Table(oid) => txn.insert_table_lock(mode, oid),
            LockTarget::Row(oid, rid) => txn.insert_row_lock(mode, oid, rid),
        }
    }

    fn remove_from_lock_sets(&self, txn: &Arc<Transaction>, mode: LockMode, target: LockTarget) {
        match target {
            LockTarget::Table(oid) => txn.remove_table_lock(mode, oid),
            LockTarget::Row(oid, rid) => txn.remove_row_lock(mode, oid, rid),
        }
    }

    /// Releasing S or X moves a GROWING transaction to SHRINKING, except
    /// that S release keeps READ_COMMITTED transactions growing (cursor
    /// stability). Intention releases never change phase.
    fn transition_on_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    /// Drop the transaction's granted request from a queue. A still-waiting
    /// request is left alone: the blocked thread observes ABORTED on its
    /// next wakeup and withdraws itself.
    fn remove_requests_of(&self, queue: &Arc<LockRequestQueue>, txn_id: TxnId) {
        let mut state = queue.state.lock();
        state.requests.retain(|r| r.txn_id != txn_id || !r.granted);
        drop(state);
        queue.cv.notify_all();
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        TransactionError::Aborted {
            txn_id: txn.id(),
            reason,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        *self.shutdown.lock() = true;
        self.shutdown_cv.notify_all();
        if let Some(handle) = self.detector.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
