#![forbid(unsafe_code)]

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use inventory_kernel_contracts::asset::{AssetFields, AssetId};
use inventory_kernel_contracts::history::{HistoryAction, HistoryEntryInput};
use inventory_kernel_contracts::principal::PrincipalId;
use inventory_kernel_contracts::MonotonicTimeNs;
use inventory_storage::repo::{AssetRecordRepo, HistoryLedgerRepo, UnitOfWork};
use inventory_storage::sqlite::SqliteInventoryStore;
use inventory_storage::store::{InventoryStore, StorageError};

fn p(id: &str) -> PrincipalId {
    PrincipalId::new(id).unwrap()
}

fn fields(model: &str, location: &str) -> AssetFields {
    AssetFields::required(model, location).unwrap()
}

fn t(minute: u64) -> MonotonicTimeNs {
    MonotonicTimeNs::from_minutes(minute)
}

fn check_create_and_id_allocation<R: AssetRecordRepo>(repo: &mut R) {
    let a = repo.create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(1)).unwrap();
    let r = repo.asset_row(a).unwrap().unwrap();
    assert_eq!(r.version, 1);
    assert_eq!(r.created_by, p("alice@x.io"));
    assert_eq!(r.updated_by, p("alice@x.io"));
    assert_eq!(r.created_at, t(1));

    assert_eq!(repo.delete_asset_row(a).unwrap().as_deref(), Some("R730"));
    let b = repo.create_asset_row(fields("DL380", "DC2"), &p("alice@x.io"), t(2)).unwrap();
    assert!(b > a);
    assert!(repo.asset_row(a).unwrap().is_none());
    assert_eq!(repo.delete_asset_row(a).unwrap(), None);
}

#[test]
fn at_assets_db_01_create_starts_at_version_one_and_ids_are_never_reused() {
    check_create_and_id_allocation(&mut InventoryStore::new_in_memory());
    check_create_and_id_allocation(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_update_bumps_version<R: AssetRecordRepo>(repo: &mut R) {
    let id = repo.create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(1)).unwrap();
    let updated = repo
        .conditional_update_asset_row(id, fields("R730", "DC2"), 1, &p("bob@x.io"), t(5))
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.fields.location, "DC2");
    assert_eq!(updated.updated_by, p("bob@x.io"));
    assert_eq!(updated.updated_at, t(5));
    assert_eq!(updated.created_by, p("alice@x.io"));

    let again = repo
        .conditional_update_asset_row(id, fields("R740", "DC2"), 2, &p("alice@x.io"), t(6))
        .unwrap();
    assert_eq!(again.version, 3);
    assert_eq!(repo.asset_row(id).unwrap().unwrap(), again);
}

#[test]
fn at_assets_db_02_conditional_update_increments_version_by_exactly_one() {
    check_update_bumps_version(&mut InventoryStore::new_in_memory());
    check_update_bumps_version(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_stale_version_rejected<R: AssetRecordRepo>(repo: &mut R) {
    let id = repo.create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(1)).unwrap();
    repo.conditional_update_asset_row(id, fields("R730", "DC2"), 1, &p("bob@x.io"), t(3))
        .unwrap();
    let before = repo.asset_row(id).unwrap().unwrap();

    let err = repo
        .conditional_update_asset_row(id, fields("R730", "DC3"), 1, &p("alice@x.io"), t(4))
        .unwrap_err();
    match err {
        StorageError::VersionConflict {
            asset_id,
            expected_version,
            current_version,
            updated_by,
            updated_at,
        } => {
            assert_eq!(asset_id, id);
            assert_eq!(expected_version, 1);
            assert_eq!(current_version, 2);
            assert_eq!(updated_by, p("bob@x.io"));
            assert_eq!(updated_at, t(3));
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }
    assert_eq!(repo.asset_row(id).unwrap().unwrap(), before);
}

#[test]
fn at_assets_db_03_stale_version_is_rejected_and_mutates_nothing() {
    check_stale_version_rejected(&mut InventoryStore::new_in_memory());
    check_stale_version_rejected(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_missing_record<R: AssetRecordRepo>(repo: &mut R) {
    let err = repo
        .conditional_update_asset_row(AssetId(42), fields("R730", "DC1"), 1, &p("alice@x.io"), t(1))
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { table: "assets", .. }));
}

#[test]
fn at_assets_db_04_update_of_missing_record_is_not_found() {
    check_missing_record(&mut InventoryStore::new_in_memory());
    check_missing_record(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_list_order<R: AssetRecordRepo>(repo: &mut R) {
    for (i, model) in ["A", "B", "C"].iter().enumerate() {
        repo.create_asset_row(fields(model, "DC1"), &p("alice@x.io"), t(i as u64 + 1))
            .unwrap();
    }
    let models: Vec<String> = repo
        .asset_rows()
        .unwrap()
        .into_iter()
        .map(|r| r.fields.model)
        .collect();
    assert_eq!(models, vec!["C", "B", "A"]);
}

#[test]
fn at_assets_db_05_list_is_newest_id_first() {
    check_list_order(&mut InventoryStore::new_in_memory());
    check_list_order(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_unit_of_work_rollback<R: AssetRecordRepo + HistoryLedgerRepo + UnitOfWork>(repo: &mut R) {
    let id = repo.create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(1)).unwrap();
    let out: Result<(), StorageError> = repo.unit_of_work(|r| {
        r.conditional_update_asset_row(id, fields("R730", "DC2"), 1, &p("alice@x.io"), t(2))?;
        Err(StorageError::Backend("history write failed".to_string()))
    });
    assert!(out.is_err());
    let r = repo.asset_row(id).unwrap().unwrap();
    assert_eq!(r.version, 1);
    assert_eq!(r.fields.location, "DC1");
    assert_eq!(repo.history_row_count().unwrap(), 0);
}

#[test]
fn at_assets_db_06_unit_of_work_rolls_back_every_write_on_error() {
    check_unit_of_work_rollback(&mut InventoryStore::new_in_memory());
    check_unit_of_work_rollback(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

#[test]
fn at_assets_db_07_racing_writers_on_same_version_exactly_one_wins_in_memory() {
    let mut s = InventoryStore::new_in_memory();
    let id = s.create_asset(fields("R730", "DC1"), &p("alice@x.io"), t(1)).unwrap();
    let store = Arc::new(Mutex::new(s));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["alice@x.io", "bob@x.io"]
        .into_iter()
        .map(|who| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut guard = store.lock().unwrap();
                guard.conditional_update_asset(
                    id,
                    fields("R730", who),
                    1,
                    &p(who),
                    t(2),
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(StorageError::VersionConflict { .. })))
            .count(),
        1
    );
    assert_eq!(store.lock().unwrap().asset(id).unwrap().version, 2);
}

#[test]
fn at_assets_db_08_racing_writers_on_same_version_exactly_one_wins_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.db");
    let mut seed = SqliteInventoryStore::open(&path).unwrap();
    let id = seed
        .create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(1))
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["alice@x.io", "bob@x.io"]
        .into_iter()
        .map(|who| {
            let mut conn = SqliteInventoryStore::open(&path).unwrap();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                conn.conditional_update_asset_row(id, fields("R730", who), 1, &p(who), t(2))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(StorageError::VersionConflict { .. })))
            .count(),
        1
    );
    assert_eq!(seed.asset_row(id).unwrap().unwrap().version, 2);
}

fn check_row_count<R: AssetRecordRepo>(repo: &mut R) {
    assert_eq!(repo.asset_row_count().unwrap(), 0);
    let a = repo.create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(1)).unwrap();
    repo.create_asset_row(fields("DL380", "DC2"), &p("alice@x.io"), t(1)).unwrap();
    assert_eq!(repo.asset_row_count().unwrap(), 2);
    repo.delete_asset_row(a).unwrap();
    assert_eq!(repo.asset_row_count().unwrap(), 1);
    assert_eq!(
        repo.asset_row_count().unwrap(),
        repo.asset_rows().unwrap().len() as u64
    );
}

#[test]
fn at_assets_db_09_row_count_follows_creates_and_deletes() {
    check_row_count(&mut InventoryStore::new_in_memory());
    check_row_count(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn create_entry(asset: AssetId, minute: u64) -> HistoryEntryInput {
    HistoryEntryInput::v1(
        asset,
        HistoryAction::Create,
        None,
        String::new(),
        "R730".to_string(),
        p("alice@x.io"),
        t(minute),
    )
    .unwrap()
}

fn check_rollback_discards_appended_history<R>(repo: &mut R)
where
    R: AssetRecordRepo + HistoryLedgerRepo + UnitOfWork,
{
    let id = repo.create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(1)).unwrap();
    repo.append_history_row(create_entry(id, 1)).unwrap();

    let out: Result<(), StorageError> = repo.unit_of_work(|r| {
        r.append_history_row(create_entry(id, 2))?;
        r.append_history_row(create_entry(id, 3))?;
        Err(StorageError::Backend("late failure".to_string()))
    });
    assert!(out.is_err());
    assert_eq!(repo.history_row_count().unwrap(), 1);

    repo.append_history_row(create_entry(id, 4)).unwrap();
    let rows = repo.history_rows(Some(id)).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].changed_at, t(4));
    assert_eq!(rows[0].prev_hash, rows[1].entry_hash);
    assert!(rows[0].entry_id > rows[1].entry_id);
    repo.verify_history_chain().unwrap();
}

#[test]
fn at_assets_db_10_rollback_discards_history_appended_inside_the_unit() {
    check_rollback_discards_appended_history(&mut InventoryStore::new_in_memory());
    check_rollback_discards_appended_history(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_clock_step_back<R: AssetRecordRepo>(repo: &mut R) {
    let id = repo.create_asset_row(fields("R730", "DC1"), &p("alice@x.io"), t(10)).unwrap();
    let after = repo
        .conditional_update_asset_row(id, fields("R730", "DC2"), 1, &p("bob@x.io"), t(4))
        .unwrap();
    assert_eq!(after.version, 2);
    assert_eq!(after.updated_at, t(10));
    assert_eq!(repo.asset_row(id).unwrap().unwrap().updated_at, t(10));
}

#[test]
fn at_assets_db_11_wall_clock_step_back_never_moves_updated_at_backwards() {
    check_clock_step_back(&mut InventoryStore::new_in_memory());
    check_clock_step_back(&mut SqliteInventoryStore::open_in_memory().unwrap());
}
