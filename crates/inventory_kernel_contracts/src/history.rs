#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

use crate::asset::AssetId;
use crate::common::{validate_opt_text, validate_text};
use crate::principal::PrincipalId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const HISTORY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// `prev_hash` of the first entry in a ledger.
pub const HISTORY_GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistoryEntryId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryAction {
    Create,
    Update,
    Delete,
}

impl HistoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAction::Create => "CREATE",
            HistoryAction::Update => "UPDATE",
            HistoryAction::Delete => "DELETE",
        }
    }

    pub fn parse(v: &str) -> Result<Self, ContractViolation> {
        match v {
            "CREATE" => Ok(HistoryAction::Create),
            "UPDATE" => Ok(HistoryAction::Update),
            "DELETE" => Ok(HistoryAction::Delete),
            _ => Err(ContractViolation::InvalidValue {
                field: "history_entry.action",
                reason: "must be one of CREATE|UPDATE|DELETE",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntryInput {
    pub schema_version: SchemaVersion,
    pub asset_id: AssetId,
    pub action: HistoryAction,
    pub field_label: Option<String>,
    pub old_value: String,
    pub new_value: String,
    pub changed_by: PrincipalId,
    pub changed_at: MonotonicTimeNs,
}

impl HistoryEntryInput {
    pub fn v1(
        asset_id: AssetId,
        action: HistoryAction,
        field_label: Option<String>,
        old_value: String,
        new_value: String,
        changed_by: PrincipalId,
        changed_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            schema_version: HISTORY_CONTRACT_VERSION,
            asset_id,
            action,
            field_label,
            old_value,
            new_value,
            changed_by,
            changed_at,
        };
        input.validate()?;
        Ok(input)
    }
}

impl Validate for HistoryEntryInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != HISTORY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "history_entry_input.schema_version",
                reason: "must match HISTORY_CONTRACT_VERSION",
            });
        }
        self.asset_id.validate()?;
        validate_opt_text("history_entry_input.field_label", &self.field_label, 64)?;
        if self.action == HistoryAction::Update && self.field_label.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "history_entry_input.field_label",
                reason: "must be present for UPDATE entries",
            });
        }
        if self.action == HistoryAction::Update && self.old_value == self.new_value {
            return Err(ContractViolation::InvalidValue {
                field: "history_entry_input.new_value",
                reason: "UPDATE entries must record a change",
            });
        }
        self.changed_by.validate()?;
        if self.changed_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "history_entry_input.changed_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub schema_version: SchemaVersion,
    pub entry_id: HistoryEntryId,
    pub asset_id: AssetId,
    pub action: HistoryAction,
    pub field_label: Option<String>,
    pub old_value: String,
    pub new_value: String,
    pub changed_by: PrincipalId,
    pub changed_at: MonotonicTimeNs,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl HistoryEntry {
    pub fn from_input_v1(
        entry_id: HistoryEntryId,
        prev_hash: &str,
        input: HistoryEntryInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        validate_hash_hex("history_entry.prev_hash", prev_hash)?;
        let mut entry = Self {
            schema_version: HISTORY_CONTRACT_VERSION,
            entry_id,
            asset_id: input.asset_id,
            action: input.action,
            field_label: input.field_label,
            old_value: input.old_value,
            new_value: input.new_value,
            changed_by: input.changed_by,
            changed_at: input.changed_at,
            prev_hash: prev_hash.to_string(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        Ok(entry)
    }

    /// SHA-256 over `prev_hash` and the length-prefixed entry fields, lowercase hex.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.entry_id.0.to_be_bytes());
        hasher.update(self.asset_id.0.to_be_bytes());
        hash_field(&mut hasher, self.action.as_str());
        hash_field(&mut hasher, self.field_label.as_deref().unwrap_or(""));
        hash_field(&mut hasher, &self.old_value);
        hash_field(&mut hasher, &self.new_value);
        hash_field(&mut hasher, self.changed_by.as_str());
        hasher.update(self.changed_at.0.to_be_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl Validate for HistoryEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != HISTORY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "history_entry.schema_version",
                reason: "must match HISTORY_CONTRACT_VERSION",
            });
        }
        if self.entry_id.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "history_entry.entry_id",
                reason: "must be > 0",
            });
        }
        validate_hash_hex("history_entry.prev_hash", &self.prev_hash)?;
        if self.entry_hash != self.compute_hash() {
            return Err(ContractViolation::InvalidValue {
                field: "history_entry.entry_hash",
                reason: "does not match entry content",
            });
        }
        Ok(())
    }
}

/// A history entry joined with the principal directory and, while it exists, the asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryView {
    pub entry: HistoryEntry,
    pub changed_by_name: String,
    pub asset_model: Option<String>,
}

fn hash_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn validate_hash_hex(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    validate_text(field, value, 64)?;
    if value.len() != 64 || !value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be 64 lowercase hex chars",
        });
    }
    Ok(())
}
