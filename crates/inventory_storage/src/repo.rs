#![forbid(unsafe_code)]

use inventory_kernel_contracts::asset::{AssetFields, AssetId, AssetRecord, AssetRecordView};
use inventory_kernel_contracts::history::{HistoryEntry, HistoryEntryId, HistoryEntryInput};
use inventory_kernel_contracts::lock::{AdvisoryLock, LockDecision, LockTimeout};
use inventory_kernel_contracts::principal::{Principal, PrincipalId, PrincipalRecord};
use inventory_kernel_contracts::MonotonicTimeNs;

use crate::store::{InventoryStore, StorageError};

/// Typed repository interface for the versioned asset table.
pub trait AssetRecordRepo {
    fn create_asset_row(
        &mut self,
        fields: AssetFields,
        created_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetId, StorageError>;

    fn asset_row(&self, asset_id: AssetId) -> Result<Option<AssetRecord>, StorageError>;

    /// Applies `fields` only if the stored version equals `expected_version`.
    fn conditional_update_asset_row(
        &mut self,
        asset_id: AssetId,
        fields: AssetFields,
        expected_version: u64,
        updated_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, StorageError>;

    /// Returns the deleted record's model, or `None` if nothing was there.
    fn delete_asset_row(&mut self, asset_id: AssetId) -> Result<Option<String>, StorageError>;

    /// Newest id first.
    fn asset_rows(&self) -> Result<Vec<AssetRecord>, StorageError>;
    fn asset_row_count(&self) -> Result<u64, StorageError>;
}

/// Typed repository interface for the append-only edit history.
pub trait HistoryLedgerRepo {
    fn append_history_row(
        &mut self,
        input: HistoryEntryInput,
    ) -> Result<HistoryEntryId, StorageError>;

    /// Newest first; `None` means every record, including deleted ones.
    fn history_rows(&self, asset_id: Option<AssetId>) -> Result<Vec<HistoryEntry>, StorageError>;
    fn history_row_count(&self) -> Result<u64, StorageError>;
    fn attempt_overwrite_history_row(&mut self, entry_id: HistoryEntryId)
        -> Result<(), StorageError>;
    fn verify_history_chain(&self) -> Result<(), StorageError>;
}

/// Typed repository interface for the advisory edit-lock table.
pub trait AdvisoryLockRepo {
    fn acquire_lock_row(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<LockDecision, StorageError>;

    fn release_lock_row(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<(), StorageError>;

    fn inspect_lock_row(
        &self,
        asset_id: AssetId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<Option<AdvisoryLock>, StorageError>;

    fn evict_lock_row(&mut self, asset_id: AssetId) -> Result<(), StorageError>;
}

/// Typed repository interface for the principal directory.
pub trait PrincipalDirectoryRepo {
    fn upsert_principal_row(
        &mut self,
        principal: &Principal,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError>;

    fn principal_row(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<PrincipalRecord>, StorageError>;

    fn principal_row_count(&self) -> Result<u64, StorageError>;

    /// Directory name, falling back to the raw identity when unknown.
    fn display_name_for(&self, principal_id: &PrincipalId) -> Result<String, StorageError> {
        Ok(self
            .principal_row(principal_id)?
            .map(|r| r.display_name)
            .unwrap_or_else(|| principal_id.to_string()))
    }
}

/// Runs `f` atomically: every write it made persists, or none does.
pub trait UnitOfWork: Sized {
    fn unit_of_work<T, F>(&mut self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Self) -> Result<T, StorageError>;
}

/// Everything the coordinator needs from a backend.
pub trait InventoryRepo:
    AssetRecordRepo + HistoryLedgerRepo + AdvisoryLockRepo + PrincipalDirectoryRepo + UnitOfWork
{
}

impl<T> InventoryRepo for T where
    T: AssetRecordRepo + HistoryLedgerRepo + AdvisoryLockRepo + PrincipalDirectoryRepo + UnitOfWork
{
}

/// Record rows joined with creator/updater display names, newest id first.
pub fn asset_views<R>(repo: &R) -> Result<Vec<AssetRecordView>, StorageError>
where
    R: AssetRecordRepo + PrincipalDirectoryRepo,
{
    repo.asset_rows()?
        .into_iter()
        .map(|record| {
            Ok(AssetRecordView {
                created_by_name: repo.display_name_for(&record.created_by)?,
                updated_by_name: repo.display_name_for(&record.updated_by)?,
                record,
            })
        })
        .collect()
}

impl AssetRecordRepo for InventoryStore {
    fn create_asset_row(
        &mut self,
        fields: AssetFields,
        created_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetId, StorageError> {
        self.create_asset(fields, created_by, now)
    }

    fn asset_row(&self, asset_id: AssetId) -> Result<Option<AssetRecord>, StorageError> {
        Ok(self.asset(asset_id).cloned())
    }

    fn conditional_update_asset_row(
        &mut self,
        asset_id: AssetId,
        fields: AssetFields,
        expected_version: u64,
        updated_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, StorageError> {
        self.conditional_update_asset(asset_id, fields, expected_version, updated_by, now)
    }

    fn delete_asset_row(&mut self, asset_id: AssetId) -> Result<Option<String>, StorageError> {
        Ok(self.delete_asset(asset_id))
    }

    fn asset_rows(&self) -> Result<Vec<AssetRecord>, StorageError> {
        Ok(self.assets().values().rev().cloned().collect())
    }

    fn asset_row_count(&self) -> Result<u64, StorageError> {
        Ok(self.assets().len() as u64)
    }
}

impl HistoryLedgerRepo for InventoryStore {
    fn append_history_row(
        &mut self,
        input: HistoryEntryInput,
    ) -> Result<HistoryEntryId, StorageError> {
        self.append_history_entry(input)
    }

    fn history_rows(&self, asset_id: Option<AssetId>) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self.history_newest_first(asset_id))
    }

    fn history_row_count(&self) -> Result<u64, StorageError> {
        Ok(self.history_entries().len() as u64)
    }

    fn attempt_overwrite_history_row(
        &mut self,
        entry_id: HistoryEntryId,
    ) -> Result<(), StorageError> {
        self.attempt_overwrite_history_entry(entry_id)
    }

    fn verify_history_chain(&self) -> Result<(), StorageError> {
        InventoryStore::verify_history_chain(self)
    }
}

impl AdvisoryLockRepo for InventoryStore {
    fn acquire_lock_row(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<LockDecision, StorageError> {
        self.acquire_lock(asset_id, holder, now, timeout)
    }

    fn release_lock_row(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<(), StorageError> {
        self.release_lock(asset_id, holder, now, timeout)
    }

    fn inspect_lock_row(
        &self,
        asset_id: AssetId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<Option<AdvisoryLock>, StorageError> {
        Ok(self.inspect_lock(asset_id, now, timeout).cloned())
    }

    fn evict_lock_row(&mut self, asset_id: AssetId) -> Result<(), StorageError> {
        self.evict_lock(asset_id);
        Ok(())
    }
}

impl PrincipalDirectoryRepo for InventoryStore {
    fn upsert_principal_row(
        &mut self,
        principal: &Principal,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        self.upsert_principal(principal, now)
    }

    fn principal_row(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Option<PrincipalRecord>, StorageError> {
        Ok(self.principal(principal_id).cloned())
    }

    fn principal_row_count(&self) -> Result<u64, StorageError> {
        Ok(self.principals().len() as u64)
    }
}

impl UnitOfWork for InventoryStore {
    fn unit_of_work<T, F>(&mut self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Self) -> Result<T, StorageError>,
    {
        let checkpoint = self.checkpoint();
        let out = f(self);
        if out.is_err() {
            self.restore(checkpoint);
        }
        out
    }
}
