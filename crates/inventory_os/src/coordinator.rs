#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use inventory_engines::search::{filter_history, filter_records};
use inventory_kernel_contracts::asset::{AssetFields, AssetId, AssetRecord, AssetRecordView};
use inventory_kernel_contracts::history::HistoryView;
use inventory_kernel_contracts::lock::{AdvisoryLock, LockDecisionAction, LockTimeout};
use inventory_kernel_contracts::principal::{Principal, PrincipalId};
use inventory_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use inventory_storage::ledger::HistoryLedgerRuntime;
use inventory_storage::repo::{asset_views, InventoryRepo};
use inventory_storage::store::StorageError;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::session::{EditSession, EditSessionState};

/// RFC 3339 (UTC, second precision) rendering of a stored timestamp.
pub fn format_timestamp(t: MonotonicTimeNs) -> String {
    let nanos = (t.0 % 1_000_000_000) as u32;
    i64::try_from(t.0 / 1_000_000_000)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, nanos))
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| t.0.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub lock_timeout: LockTimeout,
}

impl CoordinatorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            lock_timeout: LockTimeout::default_v1(),
        }
    }

    pub fn with_lock_timeout_minutes(minutes: u64) -> Result<Self, ContractViolation> {
        Ok(Self {
            lock_timeout: LockTimeout::from_minutes(minutes)?,
        })
    }
}

/// Every expected way a coordinator call can fail. None of these are fatal to the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditFailure {
    #[error("validation failed: {0}")]
    ValidationError(ContractViolation),
    #[error("record {asset_id} is being edited by {holder_name}")]
    LockDenied {
        asset_id: AssetId,
        holder: PrincipalId,
        holder_name: String,
        acquired_at: MonotonicTimeNs,
    },
    #[error("record {asset_id} changed underneath (now version {current_version})")]
    VersionConflict {
        asset_id: AssetId,
        current_version: u64,
        updated_by: PrincipalId,
        updated_by_name: String,
        updated_at: MonotonicTimeNs,
    },
    #[error("record {asset_id} not found")]
    NotFound { asset_id: AssetId },
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl EditFailure {
    /// Text suitable for showing to the person who triggered the failure.
    pub fn user_message(&self) -> String {
        match self {
            EditFailure::ValidationError(v) => format!("please check the input: {v}"),
            EditFailure::LockDenied {
                holder_name,
                acquired_at,
                ..
            } => format!(
                "being edited by {holder_name} since {}",
                format_timestamp(*acquired_at)
            ),
            EditFailure::VersionConflict {
                updated_by_name,
                updated_at,
                ..
            } => format!(
                "updated by {updated_by_name} at {}; please reload",
                format_timestamp(*updated_at)
            ),
            EditFailure::NotFound { .. } => "record no longer exists".to_string(),
            EditFailure::StorageFailure(_) => {
                "the inventory store is unavailable; please try again".to_string()
            }
        }
    }
}

impl From<ContractViolation> for EditFailure {
    fn from(v: ContractViolation) -> Self {
        EditFailure::ValidationError(v)
    }
}

fn storage_failure(op: &'static str, e: StorageError) -> EditFailure {
    match e {
        StorageError::ContractViolation(v) => EditFailure::ValidationError(v),
        other => {
            error!(op, error = %other, "storage failure");
            EditFailure::StorageFailure(other.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolderView {
    pub lock: AdvisoryLock,
    pub holder_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryChainStatus {
    Intact,
    BrokenAt(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventoryStatistics {
    pub records: u64,
    pub history_entries: u64,
    pub principals: u64,
}

/// Combines the advisory lock table, the versioned record store and the history ledger into
/// the user-facing edit workflow. Every mutation takes the acting principal and `now`.
#[derive(Debug)]
pub struct Coordinator<R> {
    config: CoordinatorConfig,
    repo: R,
}

impl<R: InventoryRepo> Coordinator<R> {
    pub fn new(config: CoordinatorConfig, repo: R) -> Self {
        Self { config, repo }
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn login(&mut self, principal: &Principal, now: MonotonicTimeNs) -> Result<(), EditFailure> {
        principal.validate()?;
        self.repo
            .upsert_principal_row(principal, now)
            .map_err(|e| storage_failure("login", e))?;
        debug!(principal = %principal.id, "principal directory refreshed");
        Ok(())
    }

    pub fn create_record(
        &mut self,
        principal: &Principal,
        fields: AssetFields,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, EditFailure> {
        fields.validate()?;
        let by = principal.id.clone();
        let record = self
            .repo
            .unit_of_work(|repo| {
                let model = fields.model.clone();
                let asset_id = repo.create_asset_row(fields, &by, now)?;
                HistoryLedgerRuntime::record_create(repo, asset_id, &model, &by, now)?;
                repo.asset_row(asset_id)?.ok_or_else(|| StorageError::NotFound {
                    table: "assets",
                    key: asset_id.to_string(),
                })
            })
            .map_err(|e| storage_failure("create_record", e))?;
        info!(asset_id = %record.asset_id, principal = %by, "record created");
        Ok(record)
    }

    /// Acquires the advisory lock, then captures the record's current version in `session`.
    pub fn begin_edit(
        &mut self,
        session: &mut EditSession,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, EditFailure> {
        session.rearm()?;
        session.transition(EditSessionState::LockPending)?;
        let principal = session.principal().clone();
        match self.open_edit(&principal, session.asset_id(), now) {
            Ok(record) => {
                session.transition(EditSessionState::Editing)?;
                session.capture(record.clone());
                Ok(record)
            }
            Err(failure) => {
                session.transition(EditSessionState::Idle)?;
                Err(failure)
            }
        }
    }

    /// Session-less form of `begin_edit` for callers that carry the version themselves.
    pub fn open_edit(
        &mut self,
        principal: &Principal,
        asset_id: AssetId,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, EditFailure> {
        let timeout = self.config.lock_timeout;
        let decision = match self
            .repo
            .acquire_lock_row(asset_id, &principal.id, now, timeout)
        {
            Ok(decision) => decision,
            Err(StorageError::NotFound { .. }) => return Err(EditFailure::NotFound { asset_id }),
            Err(e) => return Err(storage_failure("acquire_lock", e)),
        };

        if decision.action == LockDecisionAction::Deny {
            let held = decision.held_by.ok_or(ContractViolation::InvalidValue {
                field: "lock_decision.held_by",
                reason: "must be present when action=DENY",
            })?;
            let holder_name = self
                .repo
                .display_name_for(&held.holder)
                .map_err(|e| storage_failure("display_name", e))?;
            info!(
                asset_id = %asset_id,
                principal = %principal.id,
                holder = %held.holder,
                "edit lock denied"
            );
            return Err(EditFailure::LockDenied {
                asset_id,
                holder: held.holder,
                holder_name,
                acquired_at: held.acquired_at,
            });
        }

        let record = match self.repo.asset_row(asset_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.release_quietly(asset_id, &principal.id, now);
                return Err(EditFailure::NotFound { asset_id });
            }
            Err(e) => {
                self.release_quietly(asset_id, &principal.id, now);
                return Err(storage_failure("read_record", e));
            }
        };
        debug!(
            asset_id = %asset_id,
            principal = %principal.id,
            version = record.version,
            reason_code = decision.reason_code.0,
            "edit lock granted"
        );
        Ok(record)
    }

    pub fn submit_edit(
        &mut self,
        session: &mut EditSession,
        fields: AssetFields,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, EditFailure> {
        // Invalid input leaves the session editing.
        fields.validate()?;
        let expected_version = session.expected_version().ok_or(ContractViolation::InvalidValue {
            field: "edit_session.snapshot",
            reason: "must be captured before submit",
        })?;
        session.transition(EditSessionState::Committing)?;

        let principal = session.principal().clone();
        let out = self.submit_update(&principal, session.asset_id(), expected_version, fields, now);
        let next = match &out {
            Ok(_) => EditSessionState::Done,
            Err(EditFailure::VersionConflict { .. }) => EditSessionState::ConflictDetected,
            Err(EditFailure::NotFound { .. }) => EditSessionState::Idle,
            Err(_) => EditSessionState::Editing,
        };
        session.transition(next)?;
        out
    }

    /// Conditional update plus per-field history as one unit of work, then lock release.
    pub fn submit_update(
        &mut self,
        principal: &Principal,
        asset_id: AssetId,
        expected_version: u64,
        fields: AssetFields,
        now: MonotonicTimeNs,
    ) -> Result<AssetRecord, EditFailure> {
        fields.validate()?;
        let by = principal.id.clone();
        let out = self.repo.unit_of_work(|repo| {
            let before = repo
                .asset_row(asset_id)?
                .ok_or_else(|| StorageError::NotFound {
                    table: "assets",
                    key: asset_id.to_string(),
                })?;
            let after =
                repo.conditional_update_asset_row(asset_id, fields, expected_version, &by, now)?;
            HistoryLedgerRuntime::record_update(repo, asset_id, &before.fields, &after.fields, &by, now)?;
            Ok(after)
        });

        match out {
            Ok(record) => {
                self.release_quietly(asset_id, &by, now);
                info!(
                    asset_id = %asset_id,
                    principal = %by,
                    version = record.version,
                    "record updated"
                );
                Ok(record)
            }
            Err(StorageError::VersionConflict {
                current_version,
                updated_by,
                updated_at,
                ..
            }) => {
                // Only our own claim is dropped; someone else's lock is left alone.
                self.release_quietly(asset_id, &by, now);
                let updated_by_name = self
                    .repo
                    .display_name_for(&updated_by)
                    .map_err(|e| storage_failure("display_name", e))?;
                warn!(
                    asset_id = %asset_id,
                    principal = %by,
                    expected_version,
                    current_version,
                    "version conflict"
                );
                Err(EditFailure::VersionConflict {
                    asset_id,
                    current_version,
                    updated_by,
                    updated_by_name,
                    updated_at,
                })
            }
            Err(StorageError::NotFound { .. }) => {
                info!(asset_id = %asset_id, principal = %by, "update target no longer exists");
                Err(EditFailure::NotFound { asset_id })
            }
            Err(e) => Err(storage_failure("submit_update", e)),
        }
    }

    pub fn cancel_edit(
        &mut self,
        session: &mut EditSession,
        now: MonotonicTimeNs,
    ) -> Result<(), EditFailure> {
        session.transition(EditSessionState::Cancelled)?;
        let principal = session.principal().id.clone();
        let released = self.release_edit(&principal, session.asset_id(), now);
        session.transition(EditSessionState::Idle)?;
        released
    }

    pub fn release_edit(
        &mut self,
        principal: &PrincipalId,
        asset_id: AssetId,
        now: MonotonicTimeNs,
    ) -> Result<(), EditFailure> {
        self.repo
            .release_lock_row(asset_id, principal, now, self.config.lock_timeout)
            .map_err(|e| storage_failure("release_lock", e))
    }

    fn release_quietly(&mut self, asset_id: AssetId, principal: &PrincipalId, now: MonotonicTimeNs) {
        if let Err(e) =
            self.repo
                .release_lock_row(asset_id, principal, now, self.config.lock_timeout)
        {
            // The lock timeout reclaims it.
            warn!(asset_id = %asset_id, principal = %principal, error = %e, "lock release failed");
        }
    }

    /// Unconditional; needs neither the lock nor a version.
    pub fn delete_record(
        &mut self,
        principal: &Principal,
        asset_id: AssetId,
        now: MonotonicTimeNs,
    ) -> Result<(), EditFailure> {
        let by = principal.id.clone();
        let deleted = self
            .repo
            .unit_of_work(|repo| {
                let Some(model) = repo.delete_asset_row(asset_id)? else {
                    return Ok(false);
                };
                HistoryLedgerRuntime::record_delete(repo, asset_id, &model, &by, now)?;
                repo.evict_lock_row(asset_id)?;
                Ok(true)
            })
            .map_err(|e| storage_failure("delete_record", e))?;
        if !deleted {
            return Err(EditFailure::NotFound { asset_id });
        }
        info!(asset_id = %asset_id, principal = %by, "record deleted");
        Ok(())
    }

    pub fn read_record(&self, asset_id: AssetId) -> Result<AssetRecordView, EditFailure> {
        let record = self
            .repo
            .asset_row(asset_id)
            .map_err(|e| storage_failure("read_record", e))?
            .ok_or(EditFailure::NotFound { asset_id })?;
        let created_by_name = self
            .repo
            .display_name_for(&record.created_by)
            .map_err(|e| storage_failure("display_name", e))?;
        let updated_by_name = self
            .repo
            .display_name_for(&record.updated_by)
            .map_err(|e| storage_failure("display_name", e))?;
        Ok(AssetRecordView {
            record,
            created_by_name,
            updated_by_name,
        })
    }

    pub fn list_records(&self, search: Option<&str>) -> Result<Vec<AssetRecordView>, EditFailure> {
        let views = asset_views(&self.repo).map_err(|e| storage_failure("list_records", e))?;
        Ok(filter_records(views, search))
    }

    pub fn list_history(
        &self,
        asset_id: Option<AssetId>,
        search: Option<&str>,
    ) -> Result<Vec<HistoryView>, EditFailure> {
        let views = HistoryLedgerRuntime::query(&self.repo, asset_id)
            .map_err(|e| storage_failure("list_history", e))?;
        Ok(filter_history(views, search))
    }

    pub fn inspect_lock(
        &self,
        asset_id: AssetId,
        now: MonotonicTimeNs,
    ) -> Result<Option<LockHolderView>, EditFailure> {
        let Some(lock) = self
            .repo
            .inspect_lock_row(asset_id, now, self.config.lock_timeout)
            .map_err(|e| storage_failure("inspect_lock", e))?
        else {
            return Ok(None);
        };
        let holder_name = self
            .repo
            .display_name_for(&lock.holder)
            .map_err(|e| storage_failure("display_name", e))?;
        Ok(Some(LockHolderView { lock, holder_name }))
    }

    pub fn statistics(&self) -> Result<InventoryStatistics, EditFailure> {
        let records = self
            .repo
            .asset_row_count()
            .map_err(|e| storage_failure("statistics", e))?;
        let history_entries = self
            .repo
            .history_row_count()
            .map_err(|e| storage_failure("statistics", e))?;
        let principals = self
            .repo
            .principal_row_count()
            .map_err(|e| storage_failure("statistics", e))?;
        Ok(InventoryStatistics {
            records,
            history_entries,
            principals,
        })
    }

    pub fn verify_history(&self) -> Result<HistoryChainStatus, EditFailure> {
        match self.repo.verify_history_chain() {
            Ok(()) => Ok(HistoryChainStatus::Intact),
            Err(StorageError::HistoryChainBroken { entry_id }) => {
                error!(entry_id, "history hash chain broken");
                Ok(HistoryChainStatus::BrokenAt(entry_id))
            }
            Err(e) => Err(storage_failure("verify_history", e)),
        }
    }
}
