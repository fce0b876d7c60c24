use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use stratumdb::common::types::Rid;
use stratumdb::transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, TransactionError, TransactionManager,
    TransactionState,
};

const TABLE_A: u32 = 1;
const TABLE_B: u32 = 2;
const TABLE_C: u32 = 3;

fn setup() -> (Arc<LockManager>, TransactionManager) {
    let lock_manager = LockManager::new(Duration::from_millis(50));
    let txn_manager = TransactionManager::new(lock_manager.clone());
    (lock_manager, txn_manager)
}

fn abort_reason(err: &TransactionError) -> Option<AbortReason> {
    match err {
        TransactionError::Aborted { reason, .. } => Some(*reason),
        _ => None,
    }
}

#[test]
fn test_shared_locks_are_compatible() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::Shared, TABLE_A)?);

    lm.unlock_table(&t1, TABLE_A)?;
    lm.unlock_table(&t2, TABLE_A)?;
    assert_eq!(t1.state(), TransactionState::Shrinking);
    Ok(())
}

#[test]
fn test_exclusive_blocks_until_release() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, TABLE_A)?);

    let granted = Arc::new(AtomicBool::new(false));
    let handle = {
        let lm = lm.clone();
        let t2 = t2.clone();
        let granted = granted.clone();
        thread::spawn(move || {
            let result = lm.lock_table(&t2, LockMode::Shared, TABLE_A).unwrap();
            granted.store(true, Ordering::SeqCst);
            result
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!granted.load(Ordering::SeqCst), "S must wait behind X");

    lm.unlock_table(&t1, TABLE_A)?;
    assert!(handle.join().unwrap());
    assert!(granted.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_upgrade_waits_for_concurrent_reader() -> Result<()> {
    // T1 and T2 both hold S; T1's upgrade to X must wait until T2 lets go,
    // and the upgrade is not an unlock: T1 stays GROWING.
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::Shared, TABLE_A)?);

    let upgraded = Arc::new(AtomicBool::new(false));
    let handle = {
        let lm = lm.clone();
        let t1 = t1.clone();
        let upgraded = upgraded.clone();
        thread::spawn(move || {
            let result = lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();
            upgraded.store(true, Ordering::SeqCst);
            result
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!upgraded.load(Ordering::SeqCst), "upgrade must wait for T2's S");

    lm.unlock_table(&t2, TABLE_A)?;
    assert!(handle.join().unwrap());
    assert_eq!(t1.state(), TransactionState::Growing);
    Ok(())
}

#[test]
fn test_incompatible_upgrade_aborts() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, TABLE_A)?);
    let err = lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(&err), Some(AbortReason::IncompatibleUpgrade));
    assert_eq!(t1.state(), TransactionState::Aborted);
    Ok(())
}

#[test]
fn test_only_one_upgrade_at_a_time() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::Shared, TABLE_A)?);

    // T1 claims the upgrade slot and waits on T2's S lock.
    let handle = {
        let lm = lm.clone();
        let t1 = t1.clone();
        thread::spawn(move || lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap())
    };
    thread::sleep(Duration::from_millis(100));

    // T2's own upgrade attempt must fail: the slot is taken.
    let err = lm.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(&err), Some(AbortReason::UpgradeConflict));
    assert_eq!(t2.state(), TransactionState::Aborted);

    // Aborting T2 releases its S lock; T1's upgrade goes through.
    tm.abort(&t2)?;
    assert!(handle.join().unwrap());
    Ok(())
}

#[test]
fn test_read_uncommitted_rejects_shared() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadUncommitted);

    for mode in [
        LockMode::Shared,
        LockMode::IntentionShared,
        LockMode::SharedIntentionExclusive,
    ] {
        let t = tm.begin(IsolationLevel::ReadUncommitted);
        let err = lm.lock_table(&t, mode, TABLE_A).unwrap_err();
        assert_eq!(
            abort_reason(&err),
            Some(AbortReason::LockSharedOnReadUncommitted)
        );
        assert_eq!(t.state(), TransactionState::Aborted);
    }

    // X and IX are fine while growing
    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_table(&t1, LockMode::Exclusive, TABLE_B)?);
    Ok(())
}

#[test]
fn test_repeatable_read_locks_on_shrinking_abort() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);
    lm.unlock_table(&t1, TABLE_A)?;
    assert_eq!(t1.state(), TransactionState::Shrinking);

    let err = lm.lock_table(&t1, LockMode::Shared, TABLE_B).unwrap_err();
    assert_eq!(abort_reason(&err), Some(AbortReason::LockOnShrinking));
    assert_eq!(t1.state(), TransactionState::Aborted);
    Ok(())
}

#[test]
fn test_read_committed_allows_reads_while_shrinking() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadCommitted);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, TABLE_A)?);
    lm.unlock_table(&t1, TABLE_A)?;
    assert_eq!(t1.state(), TransactionState::Shrinking);

    // IS and S stay legal under READ_COMMITTED while shrinking
    assert!(lm.lock_table(&t1, LockMode::IntentionShared, TABLE_B)?);
    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_C)?);

    // write locks do not
    let err = lm
        .lock_table(&t1, LockMode::IntentionExclusive, TABLE_B)
        .unwrap_err();
    assert_eq!(abort_reason(&err), Some(AbortReason::LockOnShrinking));
    Ok(())
}

#[test]
fn test_read_committed_s_unlock_keeps_growing() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadCommitted);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);
    lm.unlock_table(&t1, TABLE_A)?;
    assert_eq!(t1.state(), TransactionState::Growing);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, TABLE_B)?);
    Ok(())
}

#[test]
fn test_row_locks() -> Result<()> {
    let (lm, tm) = setup();
    let rid = Rid::new(7, 3);

    // a row lock without the covering table lock aborts
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid).unwrap_err();
    assert_eq!(abort_reason(&err), Some(AbortReason::TableLockNotPresent));

    // IS covers S rows but not X rows
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&t2, LockMode::IntentionShared, TABLE_A)?);
    assert!(lm.lock_row(&t2, LockMode::Shared, TABLE_A, rid)?);
    let err = lm.lock_row(&t2, LockMode::Exclusive, TABLE_A, rid).unwrap_err();
    assert_eq!(abort_reason(&err), Some(AbortReason::TableLockNotPresent));
    tm.abort(&t2)?;

    // IX covers X rows
    let t3 = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&t3, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_row(&t3, LockMode::Exclusive, TABLE_A, rid)?);
    lm.unlock_row(&t3, TABLE_A, rid)?;
    lm.unlock_table(&t3, TABLE_A)?;
    Ok(())
}

#[test]
fn test_intention_lock_on_row_rejected() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?);

    let err = lm
        .lock_row(&t1, LockMode::IntentionExclusive, TABLE_A, Rid::new(1, 1))
        .unwrap_err();
    assert_eq!(
        abort_reason(&err),
        Some(AbortReason::AttemptedIntentionLockOnRow)
    );
    Ok(())
}

#[test]
fn test_table_unlock_with_rows_held_aborts() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(2, 8);

    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid)?);

    let err = lm.unlock_table(&t1, TABLE_A).unwrap_err();
    assert_eq!(
        abort_reason(&err),
        Some(AbortReason::TableUnlockedBeforeUnlockingRows)
    );
    Ok(())
}

#[test]
fn test_unlock_without_lock_aborts() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm.unlock_table(&t1, TABLE_A).unwrap_err();
    assert_eq!(
        abort_reason(&err),
        Some(AbortReason::AttemptedUnlockButNoLockHeld)
    );
    Ok(())
}

#[test]
fn test_commit_releases_everything() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(5, 5);

    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid)?);
    tm.commit(&t1)?;

    // nothing left standing in the way of a new exclusive owner
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    assert!(lm.lock_table(&t2, LockMode::Exclusive, TABLE_A)?);
    Ok(())
}

#[test]
fn test_deadlock_detection_aborts_youngest() -> Result<()> {
    let (lm, tm) = setup();
    let tm = Arc::new(tm);
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    assert!(t2.id() > t1.id());

    assert!(lm.lock_table(&t1, LockMode::Exclusive, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::Exclusive, TABLE_B)?);

    let h1 = {
        let lm = lm.clone();
        let t1 = t1.clone();
        thread::spawn(move || lm.lock_table(&t1, LockMode::Exclusive, TABLE_B).unwrap())
    };
    let h2 = {
        let lm = lm.clone();
        let tm = tm.clone();
        let t2 = t2.clone();
        thread::spawn(move || {
            let granted = lm.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap();
            if !granted {
                // deadlock victim: unwind
                tm.abort(&t2).unwrap();
            }
            granted
        })
    };

    // The detector wakes every 50ms; the youngest (T2) must lose, which
    // unblocks T1's crossing request.
    assert!(!h2.join().unwrap(), "T2 is the younger txn and must be the victim");
    assert_eq!(t2.state(), TransactionState::Aborted);
    assert!(h1.join().unwrap(), "T1 must be granted after the victim unwinds");
    Ok(())
}
