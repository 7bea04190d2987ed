#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use inventory_engines::lock_policy::{live_lock, LockPolicyRuntime};
use inventory_kernel_contracts::asset::{
    AssetFields, AssetId, AssetRecord, WarrantyStatus, ASSET_CONTRACT_VERSION,
    PURCHASE_DATE_FORMAT,
};
use inventory_kernel_contracts::history::{
    HistoryAction, HistoryEntry, HistoryEntryId, HistoryEntryInput, HISTORY_CONTRACT_VERSION,
    HISTORY_GENESIS_HASH,
};
use inventory_kernel_contracts::lock::{
    AdvisoryLock, LockDecision, LockDecisionAction, LockOperation, LockPolicyRequest, LockTimeout,
};
use inventory_kernel_contracts::principal::{Principal, PrincipalId, PrincipalRecord};
use inventory_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use rusqlite::{params, Connection, OptionalExtension};

use crate::repo::{
    AdvisoryLockRepo, AssetRecordRepo, HistoryLedgerRepo, PrincipalDirectoryRepo, UnitOfWork,
};
use crate::store::{sort_newest_first, verify_chain, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    model           TEXT NOT NULL,
    location        TEXT NOT NULL,
    purchase_date   TEXT,
    warranty_status TEXT,
    network_address TEXT,
    assigned_user   TEXT,
    operating_system TEXT,
    accessories     TEXT,
    notes           TEXT,
    version         INTEGER NOT NULL DEFAULT 1,
    created_by      TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_by      TEXT NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS edit_history (
    id          INTEGER PRIMARY KEY,
    asset_id    INTEGER NOT NULL,
    action      TEXT NOT NULL,
    field_label TEXT,
    old_value   TEXT NOT NULL,
    new_value   TEXT NOT NULL,
    changed_by  TEXT NOT NULL,
    changed_at  INTEGER NOT NULL,
    prev_hash   TEXT NOT NULL,
    entry_hash  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS edit_history_asset_idx ON edit_history (asset_id, changed_at);

CREATE TRIGGER IF NOT EXISTS edit_history_no_update
BEFORE UPDATE ON edit_history
BEGIN
    SELECT RAISE(ABORT, 'edit_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS edit_history_no_delete
BEFORE DELETE ON edit_history
BEGIN
    SELECT RAISE(ABORT, 'edit_history is append-only');
END;

CREATE TABLE IF NOT EXISTS edit_locks (
    asset_id  INTEGER PRIMARY KEY,
    locked_by TEXT NOT NULL,
    locked_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS principals (
    principal_id  TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    last_login_at INTEGER NOT NULL
);
";

const ASSET_COLUMNS: &str = "id, model, location, purchase_date, warranty_status, \
     network_address, assigned_user, operating_system, accessories, notes, \
     version, created_by, created_at, updated_by, updated_at";

const HISTORY_COLUMNS: &str = "id, asset_id, action, field_label, old_value, new_value, \
     changed_by, changed_at, prev_hash, entry_hash";

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

fn to_sql_int(value: u64, column: &'static str) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Backend(format!("{column} does not fit a sqlite INTEGER")))
}

/// `None` when no INTEGER key can hold `value`, so no row can match it.
fn sql_key(value: u64) -> Option<i64> {
    i64::try_from(value).ok()
}

fn from_sql_int(value: i64, column: &'static str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Backend(format!("{column} is negative")))
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn read_asset(row: &rusqlite::Row) -> Result<AssetRecord, StorageError> {
    let purchase_date = row
        .get::<_, Option<String>>(3)?
        .map(|d| {
            NaiveDate::parse_from_str(&d, PURCHASE_DATE_FORMAT)
                .map_err(|e| StorageError::Backend(format!("assets.purchase_date: {e}")))
        })
        .transpose()?;
    let warranty_status = row
        .get::<_, Option<String>>(4)?
        .map(|w| WarrantyStatus::parse(&w))
        .transpose()?;
    let record = AssetRecord {
        schema_version: ASSET_CONTRACT_VERSION,
        asset_id: AssetId(from_sql_int(row.get(0)?, "assets.id")?),
        fields: AssetFields {
            model: row.get(1)?,
            location: row.get(2)?,
            purchase_date,
            warranty_status,
            network_address: row.get(5)?,
            assigned_user: row.get(6)?,
            operating_system: row.get(7)?,
            accessories: row.get(8)?,
            notes: row.get(9)?,
        },
        version: from_sql_int(row.get(10)?, "assets.version")?,
        created_by: PrincipalId::new(row.get::<_, String>(11)?)?,
        created_at: MonotonicTimeNs(from_sql_int(row.get(12)?, "assets.created_at")?),
        updated_by: PrincipalId::new(row.get::<_, String>(13)?)?,
        updated_at: MonotonicTimeNs(from_sql_int(row.get(14)?, "assets.updated_at")?),
    };
    record.validate()?;
    Ok(record)
}

fn read_history(row: &rusqlite::Row) -> Result<HistoryEntry, StorageError> {
    Ok(HistoryEntry {
        schema_version: HISTORY_CONTRACT_VERSION,
        entry_id: HistoryEntryId(from_sql_int(row.get(0)?, "edit_history.id")?),
        asset_id: AssetId(from_sql_int(row.get(1)?, "edit_history.asset_id")?),
        action: HistoryAction::parse(&row.get::<_, String>(2)?)?,
        field_label: row.get(3)?,
        old_value: row.get(4)?,
        new_value: row.get(5)?,
        changed_by: PrincipalId::new(row.get::<_, String>(6)?)?,
        changed_at: MonotonicTimeNs(from_sql_int(row.get(7)?, "edit_history.changed_at")?),
        prev_hash: row.get(8)?,
        entry_hash: row.get(9)?,
    })
}

fn read_lock(row: &rusqlite::Row) -> Result<AdvisoryLock, StorageError> {
    Ok(AdvisoryLock::v1(
        AssetId(from_sql_int(row.get(0)?, "edit_locks.asset_id")?),
        PrincipalId::new(row.get::<_, String>(1)?)?,
        MonotonicTimeNs(from_sql_int(row.get(2)?, "edit_locks.locked_at")?),
    )?)
}

fn optional_text(v: &Option<String>) -> Option<&str> {
    v.as_deref()
}

/// SQLite-backed store. Each open handle is one connection; concurrent handles on the same
/// file rely on SQLite's own locking plus `BEGIN IMMEDIATE` for multi-statement units.
pub struct SqliteInventoryStore {
    conn: Connection,
}

impl SqliteInventoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn current_lock(&self, asset_id: AssetId) -> Result<Option<AdvisoryLock>, StorageError> {
        let Some(id_sql) = sql_key(asset_id.0) else {
            return Ok(None);
        };
        let mut stmt = self
            .conn
            .prepare("SELECT asset_id, locked_by, locked_at FROM edit_locks WHERE asset_id = ?1")?;
        let mut rows = stmt.query(params![id_sql])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_lock(row)?)),
            None => Ok(None),
        }
    }

    /// Every physical lock row, expired ones included.
    pub fn lock_rows(&self) -> Result<Vec<AdvisoryLock>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT asset_id, locked_by, locked_at FROM edit_locks ORDER BY asset_id")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_lock(row)?);
        }
        Ok(out)
    }

    fn history_in_insertion_order(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM edit_history ORDER BY id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_history(row)?);
        }
        Ok(out)
    }
}

impl AssetRecordRepo for SqliteInventoryStore {
    fn create_asset_row(
        &mut self,
        fields: AssetFields,
        created_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetId, StorageError> {
        fields.validate()?;
        created_by.validate()?;
        if now.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "asset_record.created_at",
                reason: "must be > 0",
            }
            .into());
        }
        let now_sql = to_sql_int(now.0, "assets.created_at")?;
        self.conn.execute(
            "INSERT INTO assets (model, location, purchase_date, warranty_status, \
             network_address, assigned_user, operating_system, accessories, notes, \
             version, created_by, created_at, updated_by, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?11, ?10, ?11)",
            params![
                fields.model,
                fields.location,
                fields
                    .purchase_date
                    .map(|d| d.format(PURCHASE_DATE_FORMAT).to_string()),
                fields.warranty_status.map(|w| w.as_str()),
                optional_text(&fields.network_address),
                optional_text(&fields.assigned_user),
                optional_text(&fields.operating_system),
                optional_text(&fields.accessories),
                optional_text(&fields.notes),
                created_by.as_str(),
                now_sql,
            ],
        )?;
        Ok(AssetId(from_sql_int(
            self.conn.last_insert_rowid(),
            "assets.id",
        )?))
    }

    fn asset_row(&self, asset_id: AssetId) -> Result<Option<AssetRecord>, StorageError> {
        let Some(id_sql) = sql_key(asset_id.0) else {
            return Ok(None);
        };
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id_sql])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_asset(row)?)),
            None => Ok(None),
        }
    }

    fn conditional_update_asset_row(
        &mut self,
        asset_id: AssetId,
        fields: AssetFields,
        expected_version: u64,
        updated_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, StorageError> {
        fields.validate()?;
        updated_by.validate()?;
        let id_sql = sql_key(asset_id.0).ok_or_else(|| StorageError::NotFound {
            table: "assets",
            key: asset_id.to_string(),
        })?;
        // Stored versions start at 1, so -1 never matches and the stale path reports the row.
        let expected_sql = sql_key(expected_version).unwrap_or(-1);
        let now_sql = to_sql_int(now.0, "assets.updated_at")?;

        self.unit_of_work(|s| {
            let changed = s.conn.execute(
                "UPDATE assets SET model = ?1, location = ?2, purchase_date = ?3, \
                 warranty_status = ?4, network_address = ?5, assigned_user = ?6, \
                 operating_system = ?7, accessories = ?8, notes = ?9, \
                 version = version + 1, updated_by = ?10, updated_at = MAX(updated_at, ?11) \
                 WHERE id = ?12 AND version = ?13",
                params![
                    fields.model,
                    fields.location,
                    fields
                        .purchase_date
                        .map(|d| d.format(PURCHASE_DATE_FORMAT).to_string()),
                    fields.warranty_status.map(|w| w.as_str()),
                    optional_text(&fields.network_address),
                    optional_text(&fields.assigned_user),
                    optional_text(&fields.operating_system),
                    optional_text(&fields.accessories),
                    optional_text(&fields.notes),
                    updated_by.as_str(),
                    now_sql,
                    id_sql,
                    expected_sql,
                ],
            )?;

            let current = s.asset_row(asset_id)?.ok_or_else(|| StorageError::NotFound {
                table: "assets",
                key: asset_id.to_string(),
            })?;
            if changed == 0 {
                return Err(StorageError::VersionConflict {
                    asset_id,
                    expected_version,
                    current_version: current.version,
                    updated_by: current.updated_by,
                    updated_at: current.updated_at,
                });
            }
            Ok(current)
        })
    }

    fn delete_asset_row(&mut self, asset_id: AssetId) -> Result<Option<String>, StorageError> {
        let Some(id_sql) = sql_key(asset_id.0) else {
            return Ok(None);
        };
        self.unit_of_work(|s| {
            let model: Option<String> = s
                .conn
                .query_row(
                    "SELECT model FROM assets WHERE id = ?1",
                    params![id_sql],
                    |row| row.get(0),
                )
                .optional()?;
            if model.is_some() {
                s.conn
                    .execute("DELETE FROM assets WHERE id = ?1", params![id_sql])?;
            }
            Ok(model)
        })
    }

    fn asset_rows(&self) -> Result<Vec<AssetRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ASSET_COLUMNS} FROM assets ORDER BY id DESC"))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_asset(row)?);
        }
        Ok(out)
    }

    fn asset_row_count(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        from_sql_int(n, "assets.count")
    }
}

impl HistoryLedgerRepo for SqliteInventoryStore {
    fn append_history_row(
        &mut self,
        input: HistoryEntryInput,
    ) -> Result<HistoryEntryId, StorageError> {
        input.validate()?;
        self.unit_of_work(|s| {
            let last: Option<(i64, String)> = s
                .conn
                .query_row(
                    "SELECT id, entry_hash FROM edit_history ORDER BY id DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (next_id, prev_hash) = match last {
                Some((id, hash)) => (from_sql_int(id, "edit_history.id")? + 1, hash),
                None => (1, HISTORY_GENESIS_HASH.to_string()),
            };
            let entry = HistoryEntry::from_input_v1(HistoryEntryId(next_id), &prev_hash, input)?;
            s.conn.execute(
                &format!(
                    "INSERT INTO edit_history ({HISTORY_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    to_sql_int(entry.entry_id.0, "edit_history.id")?,
                    to_sql_int(entry.asset_id.0, "edit_history.asset_id")?,
                    entry.action.as_str(),
                    entry.field_label,
                    entry.old_value,
                    entry.new_value,
                    entry.changed_by.as_str(),
                    to_sql_int(entry.changed_at.0, "edit_history.changed_at")?,
                    entry.prev_hash,
                    entry.entry_hash,
                ],
            )?;
            Ok(entry.entry_id)
        })
    }

    fn history_rows(&self, asset_id: Option<AssetId>) -> Result<Vec<HistoryEntry>, StorageError> {
        let filter = match asset_id {
            Some(id) => match sql_key(id.0) {
                Some(key) => Some(key),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM edit_history \
             WHERE (?1 IS NULL OR asset_id = ?1) \
             ORDER BY changed_at DESC, id DESC"
        ))?;
        let mut rows = stmt.query(params![filter])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_history(row)?);
        }
        // Integer ordering matches in SQL, but keep one definition of "newest first".
        sort_newest_first(&mut out);
        Ok(out)
    }

    fn history_row_count(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM edit_history", [], |row| row.get(0))?;
        from_sql_int(n, "edit_history.count")
    }

    fn attempt_overwrite_history_row(
        &mut self,
        entry_id: HistoryEntryId,
    ) -> Result<(), StorageError> {
        let result = self.conn.execute(
            "UPDATE edit_history SET new_value = new_value WHERE id = ?1",
            params![to_sql_int(entry_id.0, "edit_history.id")?],
        );
        match result {
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::AppendOnlyViolation {
                    table: "edit_history",
                })
            }
            Err(e) => Err(e.into()),
            Ok(_) => Err(StorageError::AppendOnlyViolation {
                table: "edit_history",
            }),
        }
    }

    fn verify_history_chain(&self) -> Result<(), StorageError> {
        verify_chain(&self.history_in_insertion_order()?)
    }
}

impl AdvisoryLockRepo for SqliteInventoryStore {
    fn acquire_lock_row(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<LockDecision, StorageError> {
        if sql_key(asset_id.0).is_none() {
            return Err(StorageError::NotFound {
                table: "assets",
                key: asset_id.to_string(),
            });
        }
        // Expired iff now - locked_at > timeout.
        let cutoff = to_sql_int(
            now.0.saturating_sub(timeout.as_ns()),
            "edit_locks.locked_at",
        )?;
        self.unit_of_work(|s| {
            s.conn
                .execute("DELETE FROM edit_locks WHERE locked_at < ?1", params![cutoff])?;
            let req = LockPolicyRequest::v1(
                asset_id,
                holder.clone(),
                LockOperation::Acquire,
                now,
                timeout,
                s.current_lock(asset_id)?,
            )?;
            let decision = LockPolicyRuntime.evaluate(&req)?;
            if let (LockDecisionAction::Grant, Some(granted)) =
                (decision.action, &decision.granted)
            {
                s.conn.execute(
                    "INSERT OR REPLACE INTO edit_locks (asset_id, locked_by, locked_at) \
                     VALUES (?1, ?2, ?3)",
                    params![
                        to_sql_int(granted.asset_id.0, "edit_locks.asset_id")?,
                        granted.holder.as_str(),
                        to_sql_int(granted.acquired_at.0, "edit_locks.locked_at")?,
                    ],
                )?;
            }
            Ok(decision)
        })
    }

    fn release_lock_row(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<(), StorageError> {
        let Some(id_sql) = sql_key(asset_id.0) else {
            return Ok(());
        };
        self.unit_of_work(|s| {
            let req = LockPolicyRequest::v1(
                asset_id,
                holder.clone(),
                LockOperation::Release,
                now,
                timeout,
                s.current_lock(asset_id)?,
            )?;
            if LockPolicyRuntime.evaluate(&req)?.action == LockDecisionAction::Remove {
                s.conn.execute(
                    "DELETE FROM edit_locks WHERE asset_id = ?1 AND locked_by = ?2",
                    params![id_sql, holder.as_str()],
                )?;
            }
            Ok(())
        })
    }

    fn inspect_lock_row(
        &self,
        asset_id: AssetId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<Option<AdvisoryLock>, StorageError> {
        let current = self.current_lock(asset_id)?;
        Ok(live_lock(current.as_ref(), now, timeout).cloned())
    }

    fn evict_lock_row(&mut self, asset_id: AssetId) -> Result<(), StorageError> {
        let Some(id_sql) = sql_key(asset_id.0) else {
            return Ok(());
        };
        self.conn
            .execute("DELETE FROM edit_locks WHERE asset_id = ?1", params![id_sql])?;
        Ok(())
    }
}

impl PrincipalDirectoryRepo for SqliteInventoryStore {
    fn upsert_principal_row(
        &mut self,
        principal: &Principal,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        let record = PrincipalRecord::v1(principal, now)?;
        self.conn.execute(
            "INSERT INTO principals (principal_id, display_name, last_login_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(principal_id) DO UPDATE SET \
             display_name = excluded.display_name, last_login_at = excluded.last_login_at",
            params![
                record.principal_id.as_str(),
                record.display_name,
                to_sql_int(record.last_login_at.0, "principals.last_login_at")?,
            ],
        )?;
        Ok(())
    }

    fn principal_row(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<PrincipalRecord>, StorageError> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT display_name, last_login_at FROM principals WHERE principal_id = ?1",
                params![principal_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(display_name, last_login_at)| -> Result<PrincipalRecord, StorageError> {
            let principal = Principal::v1(principal_id.clone(), display_name)?;
            Ok(PrincipalRecord::v1(
                &principal,
                MonotonicTimeNs(from_sql_int(last_login_at, "principals.last_login_at")?),
            )?)
        })
        .transpose()
    }

    fn principal_row_count(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM principals", [], |row| row.get(0))?;
        from_sql_int(n, "principals.count")
    }
}

impl UnitOfWork for SqliteInventoryStore {
    fn unit_of_work<T, F>(&mut self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Self) -> Result<T, StorageError>,
    {
        // Nested units join the enclosing transaction.
        if !self.conn.is_autocommit() {
            return f(self);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let out = f(self);
        let finish = if out.is_ok() { "COMMIT" } else { "ROLLBACK" };
        if let Err(e) = self.conn.execute_batch(finish) {
            tracing::warn!(error = %e, statement = finish, "sqlite transaction finish failed");
            if out.is_ok() {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback, "sqlite rollback after failed commit failed");
                }
                return Err(e.into());
            }
        }
        out
    }
}
