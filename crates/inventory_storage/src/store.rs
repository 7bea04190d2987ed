#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use inventory_engines::lock_policy::{live_lock, LockPolicyRuntime};
use inventory_kernel_contracts::asset::{AssetFields, AssetId, AssetRecord};
use inventory_kernel_contracts::history::{
    HistoryEntry, HistoryEntryId, HistoryEntryInput, HISTORY_GENESIS_HASH,
};
use inventory_kernel_contracts::lock::{
    AdvisoryLock, LockDecision, LockDecisionAction, LockOperation, LockPolicyRequest, LockTimeout,
};
use inventory_kernel_contracts::principal::{Principal, PrincipalId, PrincipalRecord};
use inventory_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("{table} row {key} not found")]
    NotFound { table: &'static str, key: String },
    #[error(
        "version conflict on asset {asset_id}: expected {expected_version}, current {current_version}"
    )]
    VersionConflict {
        asset_id: AssetId,
        expected_version: u64,
        current_version: u64,
        updated_by: PrincipalId,
        updated_at: MonotonicTimeNs,
    },
    #[error("{table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("history chain broken at entry {entry_id}")]
    HistoryChainBroken { entry_id: u64 },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Ordering for history read-back: newest first, insertion sequence breaks ties.
pub(crate) fn sort_newest_first(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| {
        b.changed_at
            .cmp(&a.changed_at)
            .then(b.entry_id.cmp(&a.entry_id))
    });
}

/// Walks the ledger in insertion order and checks every link of the hash chain.
pub(crate) fn verify_chain<'a>(
    entries: impl IntoIterator<Item = &'a HistoryEntry>,
) -> Result<(), StorageError> {
    let mut expected_prev = HISTORY_GENESIS_HASH.to_string();
    for entry in entries {
        if entry.prev_hash != expected_prev || entry.validate().is_err() {
            return Err(StorageError::HistoryChainBroken {
                entry_id: entry.entry_id.0,
            });
        }
        expected_prev = entry.entry_hash.clone();
    }
    Ok(())
}

/// In-memory Record Store, History Ledger, Advisory Lock Table and Principal Directory.
#[derive(Debug, Clone)]
pub struct InventoryStore {
    assets: BTreeMap<AssetId, AssetRecord>,
    // Ids are never reused, even after delete.
    next_asset_id: u64,

    // Append-only; hash-chained in insertion order.
    history: Vec<HistoryEntry>,
    next_history_entry_id: u64,

    // Ephemeral; safe to drop without data loss.
    locks: BTreeMap<AssetId, AdvisoryLock>,

    principals: BTreeMap<PrincipalId, PrincipalRecord>,
}

/// Rollback point for a unit of work. The history is append-only, so only its length is kept.
#[derive(Debug)]
pub(crate) struct StoreCheckpoint {
    assets: BTreeMap<AssetId, AssetRecord>,
    next_asset_id: u64,
    history_len: usize,
    next_history_entry_id: u64,
    locks: BTreeMap<AssetId, AdvisoryLock>,
    principals: BTreeMap<PrincipalId, PrincipalRecord>,
}

impl Default for InventoryStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl InventoryStore {
    /// Copies the record, lock and principal tables; cost grows with those, not with history.
    pub(crate) fn checkpoint(&self) -> StoreCheckpoint {
        StoreCheckpoint {
            assets: self.assets.clone(),
            next_asset_id: self.next_asset_id,
            history_len: self.history.len(),
            next_history_entry_id: self.next_history_entry_id,
            locks: self.locks.clone(),
            principals: self.principals.clone(),
        }
    }

    pub(crate) fn restore(&mut self, cp: StoreCheckpoint) {
        self.assets = cp.assets;
        self.next_asset_id = cp.next_asset_id;
        self.history.truncate(cp.history_len);
        self.next_history_entry_id = cp.next_history_entry_id;
        self.locks = cp.locks;
        self.principals = cp.principals;
    }

    pub fn new_in_memory() -> Self {
        Self {
            assets: BTreeMap::new(),
            next_asset_id: 1,
            history: Vec::new(),
            next_history_entry_id: 1,
            locks: BTreeMap::new(),
            principals: BTreeMap::new(),
        }
    }

    // ------------------------
    // Record Store
    // ------------------------

    pub fn create_asset(
        &mut self,
        fields: AssetFields,
        created_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetId, StorageError> {
        fields.validate()?;
        let asset_id = AssetId(self.next_asset_id);
        let record = AssetRecord::created_v1(asset_id, fields, created_by.clone(), now)?;
        self.next_asset_id = self.next_asset_id.saturating_add(1);
        self.assets.insert(asset_id, record);
        Ok(asset_id)
    }

    pub fn asset(&self, asset_id: AssetId) -> Option<&AssetRecord> {
        self.assets.get(&asset_id)
    }

    pub fn assets(&self) -> &BTreeMap<AssetId, AssetRecord> {
        &self.assets
    }

    /// Compare-and-swap on `version`. A mismatch mutates nothing.
    pub fn conditional_update_asset(
        &mut self,
        asset_id: AssetId,
        fields: AssetFields,
        expected_version: u64,
        updated_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, StorageError> {
        fields.validate()?;
        let current = self
            .assets
            .get_mut(&asset_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "assets",
                key: asset_id.to_string(),
            })?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                asset_id,
                expected_version,
                current_version: current.version,
                updated_by: current.updated_by.clone(),
                updated_at: current.updated_at,
            });
        }

        let mut next = current.clone();
        next.fields = fields;
        next.version = expected_version.saturating_add(1);
        next.updated_by = updated_by.clone();
        next.updated_at = now.max(current.updated_at);
        next.validate()?;

        *current = next.clone();
        Ok(next)
    }

    /// Unconditional; returns the model designation for the history entry.
    pub fn delete_asset(&mut self, asset_id: AssetId) -> Option<String> {
        self.assets.remove(&asset_id).map(|r| r.fields.model)
    }

    // ------------------------
    // History Ledger (append-only)
    // ------------------------

    pub fn append_history_entry(
        &mut self,
        input: HistoryEntryInput,
    ) -> Result<HistoryEntryId, StorageError> {
        input.validate()?;
        let entry_id = HistoryEntryId(self.next_history_entry_id);
        let prev_hash = self
            .history
            .last()
            .map(|e| e.entry_hash.as_str())
            .unwrap_or(HISTORY_GENESIS_HASH);
        let entry = HistoryEntry::from_input_v1(entry_id, prev_hash, input)?;
        self.next_history_entry_id = self.next_history_entry_id.saturating_add(1);
        self.history.push(entry);
        Ok(entry_id)
    }

    pub fn history_entries(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn history_newest_first(&self, asset_id: Option<AssetId>) -> Vec<HistoryEntry> {
        let mut rows: Vec<HistoryEntry> = self
            .history
            .iter()
            .filter(|e| asset_id.map(|id| e.asset_id == id).unwrap_or(true))
            .cloned()
            .collect();
        sort_newest_first(&mut rows);
        rows
    }

    pub fn attempt_overwrite_history_entry(
        &mut self,
        _entry_id: HistoryEntryId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "edit_history",
        })
    }

    pub fn verify_history_chain(&self) -> Result<(), StorageError> {
        verify_chain(&self.history)
    }

    // ------------------------
    // Advisory Lock Table
    // ------------------------

    fn evict_expired_locks(&mut self, now: MonotonicTimeNs, timeout: LockTimeout) {
        self.locks.retain(|_, l| !l.is_expired(now, timeout));
    }

    /// Global expiry sweep, then a policy decision for this record.
    pub fn acquire_lock(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<LockDecision, StorageError> {
        self.evict_expired_locks(now, timeout);
        let req = LockPolicyRequest::v1(
            asset_id,
            holder.clone(),
            LockOperation::Acquire,
            now,
            timeout,
            self.locks.get(&asset_id).cloned(),
        )?;
        let decision = LockPolicyRuntime.evaluate(&req)?;
        if let (LockDecisionAction::Grant, Some(granted)) = (decision.action, &decision.granted) {
            self.locks.insert(asset_id, granted.clone());
        }
        Ok(decision)
    }

    pub fn release_lock(
        &mut self,
        asset_id: AssetId,
        holder: &PrincipalId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Result<(), StorageError> {
        let req = LockPolicyRequest::v1(
            asset_id,
            holder.clone(),
            LockOperation::Release,
            now,
            timeout,
            self.locks.get(&asset_id).cloned(),
        )?;
        if LockPolicyRuntime.evaluate(&req)?.action == LockDecisionAction::Remove {
            self.locks.remove(&asset_id);
        }
        Ok(())
    }

    pub fn inspect_lock(
        &self,
        asset_id: AssetId,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
    ) -> Option<&AdvisoryLock> {
        live_lock(self.locks.get(&asset_id), now, timeout)
    }

    pub fn evict_lock(&mut self, asset_id: AssetId) {
        self.locks.remove(&asset_id);
    }

    /// Physical rows, including expired ones not yet swept.
    pub fn lock_rows(&self) -> &BTreeMap<AssetId, AdvisoryLock> {
        &self.locks
    }

    // ------------------------
    // Principal Directory
    // ------------------------

    pub fn upsert_principal(
        &mut self,
        principal: &Principal,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        let record = PrincipalRecord::v1(principal, now)?;
        self.principals.insert(record.principal_id.clone(), record);
        Ok(())
    }

    pub fn principal(&self, principal_id: &PrincipalId) -> Option<&PrincipalRecord> {
        self.principals.get(principal_id)
    }

    pub fn principals(&self) -> &BTreeMap<PrincipalId, PrincipalRecord> {
        &self.principals
    }
}
