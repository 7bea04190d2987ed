#![forbid(unsafe_code)]

use chrono::NaiveDate;
use inventory_kernel_contracts::asset::{AssetFields, WarrantyStatus};
use inventory_kernel_contracts::principal::{Principal, PrincipalId};
use inventory_kernel_contracts::MonotonicTimeNs;
use inventory_storage::ledger::HistoryLedgerRuntime;
use inventory_storage::repo::{AssetRecordRepo, HistoryLedgerRepo, PrincipalDirectoryRepo};
use inventory_storage::sqlite::SqliteInventoryStore;
use inventory_storage::store::StorageError;

fn p(id: &str) -> PrincipalId {
    PrincipalId::new(id).unwrap()
}

fn t(minute: u64) -> MonotonicTimeNs {
    MonotonicTimeNs::from_minutes(minute)
}

fn full_fields() -> AssetFields {
    AssetFields::v1(
        "PowerEdge R730",
        "DC1 / rack 4",
        NaiveDate::from_ymd_opt(2021, 3, 14),
        Some(WarrantyStatus::Active),
        Some("10.0.0.5".to_string()),
        Some("ops team".to_string()),
        Some("Ubuntu 22.04".to_string()),
        Some("2x PSU".to_string()),
        Some("Spare disks in drawer 3".to_string()),
    )
    .unwrap()
}

#[test]
fn at_sqlite_db_01_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.db");

    let id = {
        let mut db = SqliteInventoryStore::open(&path).unwrap();
        db.upsert_principal_row(
            &Principal::v1(p("alice@x.io"), "Alice Admin").unwrap(),
            t(1),
        )
        .unwrap();
        let id = db.create_asset_row(full_fields(), &p("alice@x.io"), t(2)).unwrap();
        HistoryLedgerRuntime::record_create(&mut db, id, "PowerEdge R730", &p("alice@x.io"), t(2))
            .unwrap();
        id
    };

    let db = SqliteInventoryStore::open(&path).unwrap();
    let r = db.asset_row(id).unwrap().unwrap();
    assert_eq!(r.fields, full_fields());
    assert_eq!(r.version, 1);
    assert_eq!(db.history_row_count().unwrap(), 1);
    assert_eq!(db.principal_row_count().unwrap(), 1);
    assert_eq!(db.display_name_for(&p("alice@x.io")).unwrap(), "Alice Admin");
    assert!(db.verify_history_chain().is_ok());
}

#[test]
fn at_sqlite_db_02_principal_upsert_refreshes_name_and_login() {
    let mut db = SqliteInventoryStore::open_in_memory().unwrap();
    db.upsert_principal_row(&Principal::v1(p("alice@x.io"), "Alice").unwrap(), t(1))
        .unwrap();
    db.upsert_principal_row(
        &Principal::v1(p("alice@x.io"), "Alice Admin").unwrap(),
        t(9),
    )
    .unwrap();
    let row = db.principal_row(&p("alice@x.io")).unwrap().unwrap();
    assert_eq!(row.display_name, "Alice Admin");
    assert_eq!(row.last_login_at, t(9));
    assert_eq!(db.principal_row_count().unwrap(), 1);
}

#[test]
fn at_sqlite_db_03_out_of_band_tampering_breaks_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.db");
    let mut db = SqliteInventoryStore::open(&path).unwrap();
    let id = db
        .create_asset_row(full_fields(), &p("alice@x.io"), t(1))
        .unwrap();
    HistoryLedgerRuntime::record_create(&mut db, id, "PowerEdge R730", &p("alice@x.io"), t(1))
        .unwrap();
    HistoryLedgerRuntime::record_delete(&mut db, id, "PowerEdge R730", &p("alice@x.io"), t(2))
        .unwrap();
    assert!(db.verify_history_chain().is_ok());

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute_batch(
        "DROP TRIGGER edit_history_no_update;
         UPDATE edit_history SET new_value = 'Forged' WHERE id = 1;",
    )
    .unwrap();
    drop(raw);

    assert_eq!(
        db.verify_history_chain(),
        Err(StorageError::HistoryChainBroken { entry_id: 1 })
    );
}

#[test]
fn at_sqlite_db_04_history_table_rejects_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.db");
    let mut db = SqliteInventoryStore::open(&path).unwrap();
    let id = db
        .create_asset_row(full_fields(), &p("alice@x.io"), t(1))
        .unwrap();
    HistoryLedgerRuntime::record_create(&mut db, id, "PowerEdge R730", &p("alice@x.io"), t(1))
        .unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    assert!(raw.execute("DELETE FROM edit_history", []).is_err());
    assert_eq!(db.history_row_count().unwrap(), 1);
}
