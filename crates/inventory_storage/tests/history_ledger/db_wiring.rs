#![forbid(unsafe_code)]

use inventory_kernel_contracts::asset::{AssetFields, AssetId};
use inventory_kernel_contracts::history::{HistoryAction, HistoryEntryId, HistoryEntryInput};
use inventory_kernel_contracts::principal::PrincipalId;
use inventory_kernel_contracts::MonotonicTimeNs;
use inventory_storage::ledger::HistoryLedgerRuntime;
use inventory_storage::repo::{AssetRecordRepo, HistoryLedgerRepo, PrincipalDirectoryRepo};
use inventory_storage::sqlite::SqliteInventoryStore;
use inventory_storage::store::{InventoryStore, StorageError};

fn p(id: &str) -> PrincipalId {
    PrincipalId::new(id).unwrap()
}

fn t(minute: u64) -> MonotonicTimeNs {
    MonotonicTimeNs::from_minutes(minute)
}

fn update_input(asset: u64, label: &str, old: &str, new: &str, minute: u64) -> HistoryEntryInput {
    HistoryEntryInput::v1(
        AssetId(asset),
        HistoryAction::Update,
        Some(label.to_string()),
        old.to_string(),
        new.to_string(),
        p("alice@x.io"),
        t(minute),
    )
    .unwrap()
}

fn check_append_only<R: HistoryLedgerRepo>(repo: &mut R) {
    let id = repo
        .append_history_row(update_input(1, "Location", "DC1", "DC2", 1))
        .unwrap();
    assert_eq!(
        repo.attempt_overwrite_history_row(id),
        Err(StorageError::AppendOnlyViolation {
            table: "edit_history"
        })
    );
    let rows = repo.history_rows(None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].new_value, "DC2");
}

#[test]
fn at_history_db_01_existing_entries_cannot_be_overwritten() {
    check_append_only(&mut InventoryStore::new_in_memory());
    check_append_only(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_chain<R: HistoryLedgerRepo>(repo: &mut R) {
    assert!(repo.verify_history_chain().is_ok());
    let a = repo
        .append_history_row(update_input(1, "Location", "DC1", "DC2", 1))
        .unwrap();
    let b = repo
        .append_history_row(update_input(2, "OS", "", "Rocky 9", 2))
        .unwrap();
    assert_eq!(a, HistoryEntryId(1));
    assert_eq!(b, HistoryEntryId(2));
    assert!(repo.verify_history_chain().is_ok());

    let rows = repo.history_rows(None).unwrap();
    assert_eq!(rows[0].prev_hash, rows[1].entry_hash);
}

#[test]
fn at_history_db_02_hash_chain_links_every_entry() {
    check_chain(&mut InventoryStore::new_in_memory());
    check_chain(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_order_and_filter<R: HistoryLedgerRepo>(repo: &mut R) {
    repo.append_history_row(update_input(1, "Location", "DC1", "DC2", 5))
        .unwrap();
    repo.append_history_row(update_input(2, "Location", "DC1", "DC3", 5))
        .unwrap();
    // Same timestamp as the entry above; insertion order decides.
    repo.append_history_row(update_input(1, "OS", "", "Rocky 9", 5))
        .unwrap();
    repo.append_history_row(update_input(1, "Notes", "", "rack 4", 1))
        .unwrap();

    let for_one: Vec<u64> = repo
        .history_rows(Some(AssetId(1)))
        .unwrap()
        .iter()
        .map(|e| e.entry_id.0)
        .collect();
    assert_eq!(for_one, vec![3, 1, 4]);

    let all: Vec<u64> = repo
        .history_rows(None)
        .unwrap()
        .iter()
        .map(|e| e.entry_id.0)
        .collect();
    assert_eq!(all, vec![3, 2, 1, 4]);
    assert_eq!(repo.history_row_count().unwrap(), 4);
}

#[test]
fn at_history_db_03_newest_first_with_insertion_order_tie_break() {
    check_order_and_filter(&mut InventoryStore::new_in_memory());
    check_order_and_filter(&mut SqliteInventoryStore::open_in_memory().unwrap());
}

fn check_survives_delete<R>(repo: &mut R)
where
    R: AssetRecordRepo + HistoryLedgerRepo + PrincipalDirectoryRepo,
{
    let id = repo
        .create_asset_row(
            AssetFields::required("R730", "DC1").unwrap(),
            &p("alice@x.io"),
            t(1),
        )
        .unwrap();
    HistoryLedgerRuntime::record_create(repo, id, "R730", &p("alice@x.io"), t(1)).unwrap();
    let old = repo.asset_row(id).unwrap().unwrap().fields;
    let new = AssetFields::required("R730", "DC2").unwrap();
    repo.conditional_update_asset_row(id, new.clone(), 1, &p("alice@x.io"), t(2))
        .unwrap();
    HistoryLedgerRuntime::record_update(repo, id, &old, &new, &p("alice@x.io"), t(2)).unwrap();
    let model = repo.delete_asset_row(id).unwrap().unwrap();
    HistoryLedgerRuntime::record_delete(repo, id, &model, &p("alice@x.io"), t(3)).unwrap();

    let views = HistoryLedgerRuntime::query(repo, Some(id)).unwrap();
    let actions: Vec<HistoryAction> = views.iter().map(|v| v.entry.action).collect();
    assert_eq!(
        actions,
        vec![
            HistoryAction::Delete,
            HistoryAction::Update,
            HistoryAction::Create
        ]
    );
    assert_eq!(views[0].entry.old_value, "R730");
    assert!(views.iter().all(|v| v.asset_model.is_none()));
    // Unknown principals fall back to the raw identity.
    assert_eq!(views[0].changed_by_name, "alice@x.io");
}

#[test]
fn at_history_db_04_history_outlives_the_record() {
    check_survives_delete(&mut InventoryStore::new_in_memory());
    check_survives_delete(&mut SqliteInventoryStore::open_in_memory().unwrap());
}
