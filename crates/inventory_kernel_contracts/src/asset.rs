#![forbid(unsafe_code)]

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::common::{validate_opt_text, validate_text};
use crate::principal::PrincipalId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const ASSET_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const PURCHASE_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(pub u64);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Validate for AssetId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "asset_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarrantyStatus {
    Active,
    Expired,
    None,
}

impl WarrantyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WarrantyStatus::Active => "active",
            WarrantyStatus::Expired => "expired",
            WarrantyStatus::None => "none",
        }
    }

    pub fn parse(v: &str) -> Result<Self, ContractViolation> {
        match v.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(WarrantyStatus::Active),
            "expired" => Ok(WarrantyStatus::Expired),
            "none" => Ok(WarrantyStatus::None),
            _ => Err(ContractViolation::InvalidValue {
                field: "asset_fields.warranty_status",
                reason: "must be one of active|expired|none",
            }),
        }
    }
}

/// Every field the history ledger diffs, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackedField {
    Model,
    Location,
    PurchaseDate,
    WarrantyStatus,
    NetworkAddress,
    AssignedUser,
    OperatingSystem,
    Accessories,
    Notes,
}

impl TrackedField {
    pub const ALL: [TrackedField; 9] = [
        TrackedField::Model,
        TrackedField::Location,
        TrackedField::PurchaseDate,
        TrackedField::WarrantyStatus,
        TrackedField::NetworkAddress,
        TrackedField::AssignedUser,
        TrackedField::OperatingSystem,
        TrackedField::Accessories,
        TrackedField::Notes,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TrackedField::Model => "Model",
            TrackedField::Location => "Location",
            TrackedField::PurchaseDate => "Purchase date",
            TrackedField::WarrantyStatus => "Warranty status",
            TrackedField::NetworkAddress => "IP address",
            TrackedField::AssignedUser => "Assigned user",
            TrackedField::OperatingSystem => "OS",
            TrackedField::Accessories => "Accessories",
            TrackedField::Notes => "Notes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFields {
    pub model: String,
    pub location: String,
    pub purchase_date: Option<NaiveDate>,
    pub warranty_status: Option<WarrantyStatus>,
    pub network_address: Option<String>,
    pub assigned_user: Option<String>,
    pub operating_system: Option<String>,
    pub accessories: Option<String>,
    pub notes: Option<String>,
}

impl AssetFields {
    /// Builds a validated field set. Blank optional text is stored as absent.
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        model: impl Into<String>,
        location: impl Into<String>,
        purchase_date: Option<NaiveDate>,
        warranty_status: Option<WarrantyStatus>,
        network_address: Option<String>,
        assigned_user: Option<String>,
        operating_system: Option<String>,
        accessories: Option<String>,
        notes: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let f = Self {
            model: model.into().trim().to_string(),
            location: location.into().trim().to_string(),
            purchase_date,
            warranty_status,
            network_address: non_blank(network_address),
            assigned_user: non_blank(assigned_user),
            operating_system: non_blank(operating_system),
            accessories: non_blank(accessories),
            notes: non_blank(notes),
        };
        f.validate()?;
        Ok(f)
    }

    /// Shorthand for a record with only the required fields set.
    pub fn required(
        model: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        Self::v1(model, location, None, None, None, None, None, None, None)
    }

    /// Display text for one tracked field; absent values render as the empty string.
    pub fn text_of(&self, field: TrackedField) -> String {
        match field {
            TrackedField::Model => self.model.clone(),
            TrackedField::Location => self.location.clone(),
            TrackedField::PurchaseDate => self
                .purchase_date
                .map(|d| d.format(PURCHASE_DATE_FORMAT).to_string())
                .unwrap_or_default(),
            TrackedField::WarrantyStatus => self
                .warranty_status
                .map(|w| w.as_str().to_string())
                .unwrap_or_default(),
            TrackedField::NetworkAddress => self.network_address.clone().unwrap_or_default(),
            TrackedField::AssignedUser => self.assigned_user.clone().unwrap_or_default(),
            TrackedField::OperatingSystem => self.operating_system.clone().unwrap_or_default(),
            TrackedField::Accessories => self.accessories.clone().unwrap_or_default(),
            TrackedField::Notes => self.notes.clone().unwrap_or_default(),
        }
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Validate for AssetFields {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("asset_fields.model", &self.model, 128)?;
        validate_text("asset_fields.location", &self.location, 128)?;
        validate_opt_text("asset_fields.network_address", &self.network_address, 64)?;
        validate_opt_text("asset_fields.assigned_user", &self.assigned_user, 128)?;
        validate_opt_text("asset_fields.operating_system", &self.operating_system, 128)?;
        validate_opt_text("asset_fields.accessories", &self.accessories, 512)?;
        validate_opt_text("asset_fields.notes", &self.notes, 4096)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub schema_version: SchemaVersion,
    pub asset_id: AssetId,
    pub fields: AssetFields,
    pub version: u64,
    pub created_by: PrincipalId,
    pub created_at: MonotonicTimeNs,
    pub updated_by: PrincipalId,
    pub updated_at: MonotonicTimeNs,
}

impl AssetRecord {
    pub fn created_v1(
        asset_id: AssetId,
        fields: AssetFields,
        created_by: PrincipalId,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: ASSET_CONTRACT_VERSION,
            asset_id,
            fields,
            version: 1,
            updated_by: created_by.clone(),
            created_by,
            created_at,
            updated_at: created_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for AssetRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ASSET_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "asset_record.schema_version",
                reason: "must match ASSET_CONTRACT_VERSION",
            });
        }
        self.asset_id.validate()?;
        self.fields.validate()?;
        if self.version == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "asset_record.version",
                reason: "must be >= 1",
            });
        }
        self.created_by.validate()?;
        self.updated_by.validate()?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "asset_record.created_at",
                reason: "must be > 0",
            });
        }
        if self.updated_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "asset_record.updated_at",
                reason: "must be >= created_at",
            });
        }
        Ok(())
    }
}

/// A record joined with the principal directory for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecordView {
    pub record: AssetRecord,
    pub created_by_name: String,
    pub updated_by_name: String,
}
