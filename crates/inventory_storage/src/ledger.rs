#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use inventory_engines::diff::{diff_fields, normalize_field_text};
use inventory_kernel_contracts::asset::{AssetFields, AssetId};
use inventory_kernel_contracts::history::{
    HistoryAction, HistoryEntryId, HistoryEntryInput, HistoryView,
};
use inventory_kernel_contracts::principal::PrincipalId;
use inventory_kernel_contracts::MonotonicTimeNs;

use crate::repo::{AssetRecordRepo, HistoryLedgerRepo, PrincipalDirectoryRepo};
use crate::store::StorageError;

/// Disciplined writer/reader over the `edit_history` table.
///
/// Writers never mutate existing rows; an update produces one row per changed field.
#[derive(Debug, Default)]
pub struct HistoryLedgerRuntime;

impl HistoryLedgerRuntime {
    pub fn record_create<R: HistoryLedgerRepo>(
        repo: &mut R,
        asset_id: AssetId,
        model: &str,
        changed_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<HistoryEntryId, StorageError> {
        repo.append_history_row(HistoryEntryInput::v1(
            asset_id,
            HistoryAction::Create,
            None,
            String::new(),
            normalize_field_text(model),
            changed_by.clone(),
            now,
        )?)
    }

    /// Appends one UPDATE row per changed field; returns nothing written when nothing changed.
    pub fn record_update<R: HistoryLedgerRepo>(
        repo: &mut R,
        asset_id: AssetId,
        old: &AssetFields,
        new: &AssetFields,
        changed_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<Vec<HistoryEntryId>, StorageError> {
        diff_fields(old, new)
            .into_iter()
            .map(|change| {
                repo.append_history_row(HistoryEntryInput::v1(
                    asset_id,
                    HistoryAction::Update,
                    Some(change.label.to_string()),
                    change.old_value,
                    change.new_value,
                    changed_by.clone(),
                    now,
                )?)
            })
            .collect()
    }

    pub fn record_delete<R: HistoryLedgerRepo>(
        repo: &mut R,
        asset_id: AssetId,
        model: &str,
        changed_by: &PrincipalId,
        now: MonotonicTimeNs,
    ) -> Result<HistoryEntryId, StorageError> {
        repo.append_history_row(HistoryEntryInput::v1(
            asset_id,
            HistoryAction::Delete,
            None,
            normalize_field_text(model),
            String::new(),
            changed_by.clone(),
            now,
        )?)
    }

    /// Newest first, joined with display names and the record's current model while it exists.
    pub fn query<R>(repo: &R, asset_id: Option<AssetId>) -> Result<Vec<HistoryView>, StorageError>
    where
        R: HistoryLedgerRepo + AssetRecordRepo + PrincipalDirectoryRepo,
    {
        let mut models: BTreeMap<AssetId, Option<String>> = BTreeMap::new();
        let mut names: BTreeMap<PrincipalId, String> = BTreeMap::new();
        let mut out = Vec::new();
        for entry in repo.history_rows(asset_id)? {
            let asset_model = match models.get(&entry.asset_id) {
                Some(m) => m.clone(),
                None => {
                    let m = repo.asset_row(entry.asset_id)?.map(|r| r.fields.model);
                    models.insert(entry.asset_id, m.clone());
                    m
                }
            };
            let changed_by_name = match names.get(&entry.changed_by) {
                Some(n) => n.clone(),
                None => {
                    let n = repo.display_name_for(&entry.changed_by)?;
                    names.insert(entry.changed_by.clone(), n.clone());
                    n
                }
            };
            out.push(HistoryView {
                entry,
                changed_by_name,
                asset_model,
            });
        }
        Ok(out)
    }
}
