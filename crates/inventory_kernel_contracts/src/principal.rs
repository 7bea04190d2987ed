#![forbid(unsafe_code)]

use std::fmt;

use crate::common::validate_text;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PRINCIPAL_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Stable principal key handed over by the identity provider (email-shaped).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(v.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Validate for PrincipalId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("principal_id", &self.0, 254)?;
        if self.0.chars().any(char::is_whitespace) {
            return Err(ContractViolation::InvalidValue {
                field: "principal_id",
                reason: "must not contain whitespace",
            });
        }
        Ok(())
    }
}

/// A verified (identity, display name) pair. Threaded explicitly through every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: PrincipalId,
    pub display_name: String,
}

impl Principal {
    pub fn v1(id: PrincipalId, display_name: impl Into<String>) -> Result<Self, ContractViolation> {
        let p = Self {
            id,
            display_name: display_name.into(),
        };
        p.validate()?;
        Ok(p)
    }
}

impl Validate for Principal {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        validate_text("principal.display_name", &self.display_name, 128)
    }
}

/// Row in the principal directory; used only for display-name lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalRecord {
    pub schema_version: SchemaVersion,
    pub principal_id: PrincipalId,
    pub display_name: String,
    pub last_login_at: MonotonicTimeNs,
}

impl PrincipalRecord {
    pub fn v1(principal: &Principal, last_login_at: MonotonicTimeNs) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PRINCIPAL_CONTRACT_VERSION,
            principal_id: principal.id.clone(),
            display_name: principal.display_name.clone(),
            last_login_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for PrincipalRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PRINCIPAL_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "principal_record.schema_version",
                reason: "must match PRINCIPAL_CONTRACT_VERSION",
            });
        }
        self.principal_id.validate()?;
        validate_text("principal_record.display_name", &self.display_name, 128)?;
        if self.last_login_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "principal_record.last_login_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
