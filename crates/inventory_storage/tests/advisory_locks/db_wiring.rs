#![forbid(unsafe_code)]

use inventory_engines::lock_policy::reason_codes;
use inventory_kernel_contracts::asset::AssetId;
use inventory_kernel_contracts::lock::{LockDecisionAction, LockTimeout};
use inventory_kernel_contracts::principal::PrincipalId;
use inventory_kernel_contracts::MonotonicTimeNs;
use inventory_storage::repo::AdvisoryLockRepo;
use inventory_storage::sqlite::SqliteInventoryStore;
use inventory_storage::store::InventoryStore;

fn p(id: &str) -> PrincipalId {
    PrincipalId::new(id).unwrap()
}

fn t(minute: u64) -> MonotonicTimeNs {
    MonotonicTimeNs::from_minutes(minute)
}

fn timeout() -> LockTimeout {
    LockTimeout::default_v1()
}

fn check_exclusion<R: AdvisoryLockRepo>(repo: &mut R) {
    let a = repo
        .acquire_lock_row(AssetId(1), &p("alice@x.io"), t(1), timeout())
        .unwrap();
    assert!(a.is_granted());

    let b = repo
        .acquire_lock_row(AssetId(1), &p("bob@x.io"), t(5), timeout())
        .unwrap();
    assert_eq!(b.action, LockDecisionAction::Deny);
    let held = b.held_by.unwrap();
    assert_eq!(held.holder, p("alice@x.io"));
    assert_eq!(held.acquired_at, t(1));

    // Denial leaves the holder's row untouched.
    let seen = repo
        .inspect_lock_row(AssetId(1), t(5), timeout())
        .unwrap()
        .unwrap();
    assert_eq!(seen.holder, p("alice@x.io"));

    // Other records are unaffected.
    assert!(repo
        .acquire_lock_row(AssetId(2), &p("bob@x.io"), t(5), timeout())
        .unwrap()
        .is_granted());
}

#[test]
fn at_locks_db_01_second_principal_is_denied_while_lock_is_live() {
    check_exclusion(&mut InventoryStore::new_in_memory());
    check_exclusion(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_expiry<R: AdvisoryLockRepo>(repo: &mut R) {
    repo.acquire_lock_row(AssetId(1), &p("alice@x.io"), t(1), timeout())
        .unwrap();
    // Exactly at the timeout the lock is still live.
    assert!(repo
        .inspect_lock_row(AssetId(1), t(31), timeout())
        .unwrap()
        .is_some());
    assert!(repo
        .inspect_lock_row(AssetId(1), t(32), timeout())
        .unwrap()
        .is_none());

    let d = repo
        .acquire_lock_row(AssetId(1), &p("bob@x.io"), t(32), timeout())
        .unwrap();
    assert!(d.is_granted());
    assert_eq!(d.reason_code, reason_codes::LOCK_OK_GRANTED);
    let seen = repo
        .inspect_lock_row(AssetId(1), t(33), timeout())
        .unwrap()
        .unwrap();
    assert_eq!(seen.holder, p("bob@x.io"));
}

#[test]
fn at_locks_db_02_expired_lock_is_invisible_and_can_be_taken_over() {
    check_expiry(&mut InventoryStore::new_in_memory());
    check_expiry(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_release<R: AdvisoryLockRepo>(repo: &mut R) {
    repo.acquire_lock_row(AssetId(1), &p("alice@x.io"), t(1), timeout())
        .unwrap();
    repo.release_lock_row(AssetId(1), &p("bob@x.io"), t(2), timeout())
        .unwrap();
    assert!(repo
        .inspect_lock_row(AssetId(1), t(2), timeout())
        .unwrap()
        .is_some());

    repo.release_lock_row(AssetId(1), &p("alice@x.io"), t(3), timeout())
        .unwrap();
    assert!(repo
        .inspect_lock_row(AssetId(1), t(3), timeout())
        .unwrap()
        .is_none());

    // Releasing nothing is harmless.
    repo.release_lock_row(AssetId(1), &p("alice@x.io"), t(4), timeout())
        .unwrap();
}

#[test]
fn at_locks_db_03_only_the_holder_can_release() {
    check_release(&mut InventoryStore::new_in_memory());
    check_release(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_renew_and_evict<R: AdvisoryLockRepo>(repo: &mut R) {
    repo.acquire_lock_row(AssetId(1), &p("alice@x.io"), t(1), timeout())
        .unwrap();
    let renewed = repo
        .acquire_lock_row(AssetId(1), &p("alice@x.io"), t(20), timeout())
        .unwrap();
    assert_eq!(renewed.reason_code, reason_codes::LOCK_OK_RENEWED);
    // Renewal restarts the clock.
    assert!(repo
        .inspect_lock_row(AssetId(1), t(45), timeout())
        .unwrap()
        .is_some());

    repo.evict_lock_row(AssetId(1)).unwrap();
    assert!(repo
        .inspect_lock_row(AssetId(1), t(45), timeout())
        .unwrap()
        .is_none());
}

#[test]
fn at_locks_db_04_reacquire_renews_and_evict_removes_unconditionally() {
    check_renew_and_evict(&mut InventoryStore::new_in_memory());
    check_renew_and_evict(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

#[test]
fn at_locks_db_05_acquire_sweeps_expired_rows_for_every_record() {
    let mut mem = InventoryStore::new_in_memory();
    mem.acquire_lock(AssetId(1), &p("alice@x.io"), t(1), timeout())
        .unwrap();
    mem.acquire_lock(AssetId(2), &p("bob@x.io"), t(40), timeout())
        .unwrap();
    assert!(!mem.lock_rows().contains_key(&AssetId(1)));
    assert!(mem.lock_rows().contains_key(&AssetId(2)));

    let mut db = SqliteInventoryStore::open_in_memory().unwrap();
    db.acquire_lock_row(AssetId(1), &p("alice@x.io"), t(1), timeout())
        .unwrap();
    db.acquire_lock_row(AssetId(2), &p("bob@x.io"), t(40), timeout())
        .unwrap();
    let rows: Vec<AssetId> = db.lock_rows().unwrap().iter().map(|l| l.asset_id).collect();
    assert_eq!(rows, vec![AssetId(2)]);
}

#[test]
fn at_locks_db_06_custom_timeout_is_honoured() {
    let short = LockTimeout::from_minutes(5).unwrap();
    let mut db = SqliteInventoryStore::open_in_memory().unwrap();
    db.acquire_lock_row(AssetId(1), &p("alice@x.io"), t(1), short)
        .unwrap();
    assert!(db
        .acquire_lock_row(AssetId(1), &p("bob@x.io"), t(6), short)
        .unwrap()
        .held_by
        .is_some());
    assert!(db
        .acquire_lock_row(AssetId(1), &p("bob@x.io"), t(7), short)
        .unwrap()
        .is_granted());
}
