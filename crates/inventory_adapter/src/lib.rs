#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use chrono::NaiveDate;
use inventory_kernel_contracts::asset::{
    AssetFields, AssetId, AssetRecordView, WarrantyStatus, PURCHASE_DATE_FORMAT,
};
use inventory_kernel_contracts::history::HistoryView;
use inventory_kernel_contracts::principal::{Principal, PrincipalId};
use inventory_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use inventory_os::coordinator::{
    format_timestamp, Coordinator, CoordinatorConfig, EditFailure, HistoryChainStatus,
};
use inventory_storage::sqlite::SqliteInventoryStore;
use tracing::{debug, info};

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_NAME_HEADER: &str = "x-principal-name";

/// `INVENTORY_DB_PATH` value that keeps the whole inventory in memory.
pub const IN_MEMORY_DB_PATH: &str = ":memory:";
const DEFAULT_DB_PATH: &str = "server_inventory.db";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoginResponse {
    pub status: String,
    pub principal_id: String,
    pub display_name: String,
}

/// Editable record fields as they arrive on the wire. Dates are `YYYY-MM-DD`; blank optional
/// values mean "not set".
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AssetFieldsRequest {
    pub model: String,
    pub location: String,
    pub purchase_date: Option<String>,
    pub warranty_status: Option<String>,
    pub network_address: Option<String>,
    pub assigned_user: Option<String>,
    pub operating_system: Option<String>,
    pub accessories: Option<String>,
    pub notes: Option<String>,
}

impl AssetFieldsRequest {
    pub fn to_fields(&self) -> Result<AssetFields, ContractViolation> {
        let purchase_date = match non_blank(&self.purchase_date) {
            Some(v) => Some(NaiveDate::parse_from_str(v, PURCHASE_DATE_FORMAT).map_err(|_| {
                ContractViolation::InvalidValue {
                    field: "asset_fields.purchase_date",
                    reason: "must be a calendar date formatted YYYY-MM-DD",
                }
            })?),
            None => None,
        };
        let warranty_status = non_blank(&self.warranty_status)
            .map(WarrantyStatus::parse)
            .transpose()?;
        AssetFields::v1(
            self.model.clone(),
            self.location.clone(),
            purchase_date,
            warranty_status,
            self.network_address.clone(),
            self.assigned_user.clone(),
            self.operating_system.clone(),
            self.accessories.clone(),
            self.notes.clone(),
        )
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UpdateRecordRequest {
    pub expected_version: u64,
    #[serde(flatten)]
    pub fields: AssetFieldsRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordResponse {
    pub asset_id: u64,
    pub model: String,
    pub location: String,
    pub purchase_date: Option<String>,
    pub warranty_status: Option<String>,
    pub network_address: Option<String>,
    pub assigned_user: Option<String>,
    pub operating_system: Option<String>,
    pub accessories: Option<String>,
    pub notes: Option<String>,
    pub version: u64,
    pub created_by: String,
    pub created_by_name: String,
    pub created_at: String,
    pub updated_by: String,
    pub updated_by_name: String,
    pub updated_at: String,
}

impl From<AssetRecordView> for RecordResponse {
    fn from(view: AssetRecordView) -> Self {
        let r = view.record;
        let f = r.fields;
        Self {
            asset_id: r.asset_id.0,
            model: f.model,
            location: f.location,
            purchase_date: f
                .purchase_date
                .map(|d| d.format(PURCHASE_DATE_FORMAT).to_string()),
            warranty_status: f.warranty_status.map(|w| w.as_str().to_string()),
            network_address: f.network_address,
            assigned_user: f.assigned_user,
            operating_system: f.operating_system,
            accessories: f.accessories,
            notes: f.notes,
            version: r.version,
            created_by: r.created_by.as_str().to_string(),
            created_by_name: view.created_by_name,
            created_at: format_timestamp(r.created_at),
            updated_by: r.updated_by.as_str().to_string(),
            updated_by_name: view.updated_by_name,
            updated_at: format_timestamp(r.updated_at),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecordListResponse {
    pub status: String,
    pub records: Vec<RecordResponse>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EditOpenResponse {
    pub status: String,
    pub outcome: String,
    pub lock_timeout_minutes: u64,
    pub record: RecordResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HistoryEntryResponse {
    pub entry_id: u64,
    pub asset_id: u64,
    /// Absent once the record has been deleted.
    pub asset_model: Option<String>,
    pub action: String,
    pub field: Option<String>,
    pub old_value: String,
    pub new_value: String,
    pub changed_by: String,
    pub changed_by_name: String,
    pub changed_at: String,
}

impl From<HistoryView> for HistoryEntryResponse {
    fn from(view: HistoryView) -> Self {
        let e = view.entry;
        Self {
            entry_id: e.entry_id.0,
            asset_id: e.asset_id.0,
            asset_model: view.asset_model,
            action: e.action.as_str().to_string(),
            field: e.field_label,
            old_value: e.old_value,
            new_value: e.new_value,
            changed_by: e.changed_by.as_str().to_string(),
            changed_by_name: view.changed_by_name,
            changed_at: format_timestamp(e.changed_at),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HistoryListResponse {
    pub status: String,
    pub entries: Vec<HistoryEntryResponse>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HistoryVerifyResponse {
    pub status: String,
    pub outcome: String,
    pub broken_at_entry: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LockStatusResponse {
    pub status: String,
    pub asset_id: u64,
    pub locked: bool,
    pub holder: Option<String>,
    pub holder_name: Option<String>,
    pub acquired_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatsResponse {
    pub status: String,
    pub records: u64,
    pub history_entries: u64,
    pub principals: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdapterStatusResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub current_version: Option<u64>,
    pub holder: Option<String>,
}

/// A rejected request: the HTTP status to answer with and the body to send.
#[derive(Debug, Clone)]
pub struct AdapterFailure {
    pub http_status: u16,
    pub body: AdapterErrorResponse,
}

impl AdapterFailure {
    fn new(http_status: u16, outcome: &str, reason: String) -> Self {
        Self {
            http_status,
            body: AdapterErrorResponse {
                status: "error".to_string(),
                outcome: outcome.to_string(),
                reason: Some(reason),
                current_version: None,
                holder: None,
            },
        }
    }

    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::new(401, "UNAUTHENTICATED", reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(500, "INTERNAL", reason.into())
    }

    pub fn outcome(&self) -> &str {
        &self.body.outcome
    }
}

impl From<EditFailure> for AdapterFailure {
    fn from(failure: EditFailure) -> Self {
        let reason = failure.user_message();
        match failure {
            EditFailure::ValidationError(_) => Self::new(400, "VALIDATION_ERROR", reason),
            EditFailure::LockDenied { holder, .. } => {
                let mut out = Self::new(409, "LOCK_DENIED", reason);
                out.body.holder = Some(holder.as_str().to_string());
                out
            }
            EditFailure::VersionConflict {
                current_version,
                updated_by,
                ..
            } => {
                let mut out = Self::new(409, "VERSION_CONFLICT", reason);
                out.body.current_version = Some(current_version);
                out.body.holder = Some(updated_by.as_str().to_string());
                out
            }
            EditFailure::NotFound { .. } => Self::new(404, "NOT_FOUND", reason),
            EditFailure::StorageFailure(_) => Self::new(503, "STORAGE_FAILURE", reason),
        }
    }
}

impl From<ContractViolation> for AdapterFailure {
    fn from(v: ContractViolation) -> Self {
        EditFailure::from(v).into()
    }
}

/// Builds the acting principal from the identity headers. The display name falls back to the
/// id when the upstream provider does not send one.
pub fn principal_from_headers(
    principal_id: Option<&str>,
    display_name: Option<&str>,
) -> Result<Principal, AdapterFailure> {
    let id = principal_id
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AdapterFailure::unauthenticated(format!("missing {PRINCIPAL_ID_HEADER} header"))
        })?;
    let id = PrincipalId::new(id)
        .map_err(|err| AdapterFailure::unauthenticated(format!("invalid principal id: {err}")))?;
    let name = display_name
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(id.as_str())
        .to_string();
    Principal::v1(id, name)
        .map_err(|err| AdapterFailure::unauthenticated(format!("invalid principal: {err}")))
}

/// Identity headers of a request; unreadable header values count as missing.
pub fn principal_from_header_map(headers: &HeaderMap) -> Result<Principal, AdapterFailure> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    principal_from_headers(header(PRINCIPAL_ID_HEADER), header(PRINCIPAL_NAME_HEADER))
}

pub struct AdapterRuntime {
    coordinator: Coordinator<SqliteInventoryStore>,
}

impl AdapterRuntime {
    pub fn new(config: CoordinatorConfig, store: SqliteInventoryStore) -> Self {
        Self {
            coordinator: Coordinator::new(config, store),
        }
    }

    pub fn new_in_memory(config: CoordinatorConfig) -> Result<Self, String> {
        let store = SqliteInventoryStore::open_in_memory()
            .map_err(|err| format!("failed to open in-memory inventory: {err}"))?;
        Ok(Self::new(config, store))
    }

    pub fn default_from_env() -> Result<Self, String> {
        let config = match parse_lock_timeout_minutes_from_env()? {
            Some(minutes) => CoordinatorConfig::with_lock_timeout_minutes(minutes)
                .map_err(|err| format!("invalid INVENTORY_LOCK_TIMEOUT_MINUTES: {err}"))?,
            None => CoordinatorConfig::mvp_v1(),
        };
        let db_path = env::var("INVENTORY_DB_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        if db_path == IN_MEMORY_DB_PATH {
            info!("inventory kept in memory; nothing survives a restart");
            return Self::new_in_memory(config);
        }
        let path = PathBuf::from(&db_path);
        let store = SqliteInventoryStore::open(&path).map_err(|err| {
            format!("failed to open inventory database '{}': {err}", path.display())
        })?;
        info!(path = %path.display(), "inventory database opened");
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.coordinator.config()
    }

    pub fn health(&self) -> Result<AdapterStatusResponse, AdapterFailure> {
        self.coordinator.statistics()?;
        Ok(AdapterStatusResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
        })
    }

    /// Records the authenticated principal and its display name in the directory.
    pub fn login(
        &mut self,
        principal: &Principal,
        now_ns: Option<u64>,
    ) -> Result<LoginResponse, AdapterFailure> {
        self.coordinator.login(principal, now_or_system(now_ns))?;
        Ok(LoginResponse {
            status: "ok".to_string(),
            principal_id: principal.id.as_str().to_string(),
            display_name: principal.display_name.clone(),
        })
    }

    pub fn list_records(&self, search: Option<&str>) -> Result<RecordListResponse, AdapterFailure> {
        let records = self
            .coordinator
            .list_records(search)?
            .into_iter()
            .map(RecordResponse::from)
            .collect();
        Ok(RecordListResponse {
            status: "ok".to_string(),
            records,
        })
    }

    pub fn read_record(&self, asset_id: u64) -> Result<RecordResponse, AdapterFailure> {
        Ok(self.coordinator.read_record(AssetId(asset_id))?.into())
    }

    pub fn create_record(
        &mut self,
        principal: &Principal,
        request: &AssetFieldsRequest,
        now_ns: Option<u64>,
    ) -> Result<RecordResponse, AdapterFailure> {
        let fields = request.to_fields()?;
        let record = self
            .coordinator
            .create_record(principal, fields, now_or_system(now_ns))?;
        self.read_record(record.asset_id.0)
    }

    pub fn open_edit(
        &mut self,
        principal: &Principal,
        asset_id: u64,
        now_ns: Option<u64>,
    ) -> Result<EditOpenResponse, AdapterFailure> {
        self.coordinator
            .open_edit(principal, AssetId(asset_id), now_or_system(now_ns))?;
        let record = self.read_record(asset_id)?;
        Ok(EditOpenResponse {
            status: "ok".to_string(),
            outcome: "EDITING".to_string(),
            lock_timeout_minutes: self.config().lock_timeout.as_minutes(),
            record,
        })
    }

    pub fn update_record(
        &mut self,
        principal: &Principal,
        asset_id: u64,
        request: &UpdateRecordRequest,
        now_ns: Option<u64>,
    ) -> Result<RecordResponse, AdapterFailure> {
        let fields = request.fields.to_fields()?;
        self.coordinator.submit_update(
            principal,
            AssetId(asset_id),
            request.expected_version,
            fields,
            now_or_system(now_ns),
        )?;
        self.read_record(asset_id)
    }

    pub fn release_edit(
        &mut self,
        principal: &Principal,
        asset_id: u64,
        now_ns: Option<u64>,
    ) -> Result<AdapterStatusResponse, AdapterFailure> {
        self.coordinator
            .release_edit(&principal.id, AssetId(asset_id), now_or_system(now_ns))?;
        Ok(AdapterStatusResponse {
            status: "ok".to_string(),
            outcome: "RELEASED".to_string(),
            reason: None,
        })
    }

    pub fn delete_record(
        &mut self,
        principal: &Principal,
        asset_id: u64,
        now_ns: Option<u64>,
    ) -> Result<AdapterStatusResponse, AdapterFailure> {
        self.coordinator
            .delete_record(principal, AssetId(asset_id), now_or_system(now_ns))?;
        Ok(AdapterStatusResponse {
            status: "ok".to_string(),
            outcome: "DELETED".to_string(),
            reason: None,
        })
    }

    pub fn lock_status(
        &self,
        asset_id: u64,
        now_ns: Option<u64>,
    ) -> Result<LockStatusResponse, AdapterFailure> {
        let held = self
            .coordinator
            .inspect_lock(AssetId(asset_id), now_or_system(now_ns))?;
        Ok(LockStatusResponse {
            status: "ok".to_string(),
            asset_id,
            locked: held.is_some(),
            holder: held.as_ref().map(|h| h.lock.holder.as_str().to_string()),
            acquired_at: held.as_ref().map(|h| format_timestamp(h.lock.acquired_at)),
            holder_name: held.map(|h| h.holder_name),
        })
    }

    pub fn list_history(
        &self,
        asset_id: Option<u64>,
        search: Option<&str>,
    ) -> Result<HistoryListResponse, AdapterFailure> {
        let entries = self
            .coordinator
            .list_history(asset_id.map(AssetId), search)?
            .into_iter()
            .map(HistoryEntryResponse::from)
            .collect();
        Ok(HistoryListResponse {
            status: "ok".to_string(),
            entries,
        })
    }

    pub fn verify_history(&self) -> Result<HistoryVerifyResponse, AdapterFailure> {
        let out = match self.coordinator.verify_history()? {
            HistoryChainStatus::Intact => HistoryVerifyResponse {
                status: "ok".to_string(),
                outcome: "INTACT".to_string(),
                broken_at_entry: None,
            },
            HistoryChainStatus::BrokenAt(entry_id) => HistoryVerifyResponse {
                status: "error".to_string(),
                outcome: "BROKEN".to_string(),
                broken_at_entry: Some(entry_id),
            },
        };
        debug!(outcome = %out.outcome, "history chain verified");
        Ok(out)
    }

    pub fn statistics(&self) -> Result<StatsResponse, AdapterFailure> {
        let stats = self.coordinator.statistics()?;
        Ok(StatsResponse {
            status: "ok".to_string(),
            records: stats.records,
            history_entries: stats.history_entries,
            principals: stats.principals,
        })
    }
}

fn parse_lock_timeout_minutes_from_env() -> Result<Option<u64>, String> {
    match env::var("INVENTORY_LOCK_TIMEOUT_MINUTES") {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("INVENTORY_LOCK_TIMEOUT_MINUTES must be an integer, got '{v}'")),
        _ => Ok(None),
    }
}

fn now_or_system(now_ns: Option<u64>) -> MonotonicTimeNs {
    MonotonicTimeNs(now_ns.unwrap_or_else(system_time_now_ns))
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    u64::try_from(nanos).unwrap_or(u64::MAX)
}
