#![forbid(unsafe_code)]

use crate::asset::AssetId;
use crate::common::NANOS_PER_MINUTE;
use crate::principal::PrincipalId;
use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const LOCK_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const DEFAULT_LOCK_TIMEOUT_MINUTES: u64 = 30;
pub const MAX_LOCK_TIMEOUT_MINUTES: u64 = 24 * 60;

/// Advisory "who is editing this record" claim. Never consulted by the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryLock {
    pub schema_version: SchemaVersion,
    pub asset_id: AssetId,
    pub holder: PrincipalId,
    pub acquired_at: MonotonicTimeNs,
}

impl AdvisoryLock {
    pub fn v1(
        asset_id: AssetId,
        holder: PrincipalId,
        acquired_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let lock = Self {
            schema_version: LOCK_CONTRACT_VERSION,
            asset_id,
            holder,
            acquired_at,
        };
        lock.validate()?;
        Ok(lock)
    }

    /// A lock is expired once its age strictly exceeds the timeout.
    pub fn is_expired(&self, now: MonotonicTimeNs, timeout: LockTimeout) -> bool {
        now.elapsed_since(self.acquired_at) > timeout.as_ns()
    }
}

impl Validate for AdvisoryLock {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != LOCK_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "advisory_lock.schema_version",
                reason: "must match LOCK_CONTRACT_VERSION",
            });
        }
        self.asset_id.validate()?;
        self.holder.validate()?;
        if self.acquired_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "advisory_lock.acquired_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockTimeout(u64);

impl LockTimeout {
    pub fn from_minutes(minutes: u64) -> Result<Self, ContractViolation> {
        if minutes == 0 || minutes > MAX_LOCK_TIMEOUT_MINUTES {
            return Err(ContractViolation::InvalidRange {
                field: "lock_timeout_minutes",
                min: 1.0,
                max: MAX_LOCK_TIMEOUT_MINUTES as f64,
                got: minutes as f64,
            });
        }
        Ok(Self(MonotonicTimeNs::from_minutes(minutes).0))
    }

    pub fn default_v1() -> Self {
        Self(MonotonicTimeNs::from_minutes(DEFAULT_LOCK_TIMEOUT_MINUTES).0)
    }

    pub fn as_ns(self) -> u64 {
        self.0
    }

    pub fn as_minutes(self) -> u64 {
        self.0 / NANOS_PER_MINUTE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOperation {
    Acquire,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDecisionAction {
    /// Write `(requester, now)` as the lock row.
    Grant,
    /// Leave the table unchanged.
    Deny,
    /// Delete the lock row.
    Remove,
    /// Nothing to do (release by a non-holder or of an absent lock).
    NoOp,
}

/// Snapshot handed to the lock policy: the requester plus whatever row is physically present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicyRequest {
    pub schema_version: SchemaVersion,
    pub asset_id: AssetId,
    pub requester: PrincipalId,
    pub operation: LockOperation,
    pub now: MonotonicTimeNs,
    pub timeout: LockTimeout,
    pub current: Option<AdvisoryLock>,
}

impl LockPolicyRequest {
    pub fn v1(
        asset_id: AssetId,
        requester: PrincipalId,
        operation: LockOperation,
        now: MonotonicTimeNs,
        timeout: LockTimeout,
        current: Option<AdvisoryLock>,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: LOCK_CONTRACT_VERSION,
            asset_id,
            requester,
            operation,
            now,
            timeout,
            current,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for LockPolicyRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != LOCK_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "lock_policy_request.schema_version",
                reason: "must match LOCK_CONTRACT_VERSION",
            });
        }
        self.asset_id.validate()?;
        self.requester.validate()?;
        if self.now.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "lock_policy_request.now",
                reason: "must be > 0",
            });
        }
        if let Some(current) = &self.current {
            current.validate()?;
            if current.asset_id != self.asset_id {
                return Err(ContractViolation::InvalidValue {
                    field: "lock_policy_request.current.asset_id",
                    reason: "must match request asset_id",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDecision {
    pub schema_version: SchemaVersion,
    pub reason_code: ReasonCodeId,
    pub action: LockDecisionAction,
    /// The unexpired lock held by someone else when the decision is `Deny`.
    pub held_by: Option<AdvisoryLock>,
    /// The row to write when the decision is `Grant`.
    pub granted: Option<AdvisoryLock>,
}

impl LockDecision {
    pub fn v1(
        reason_code: ReasonCodeId,
        action: LockDecisionAction,
        held_by: Option<AdvisoryLock>,
        granted: Option<AdvisoryLock>,
    ) -> Result<Self, ContractViolation> {
        let d = Self {
            schema_version: LOCK_CONTRACT_VERSION,
            reason_code,
            action,
            held_by,
            granted,
        };
        d.validate()?;
        Ok(d)
    }

    pub fn is_granted(&self) -> bool {
        self.action == LockDecisionAction::Grant
    }
}

impl Validate for LockDecision {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != LOCK_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "lock_decision.schema_version",
                reason: "must match LOCK_CONTRACT_VERSION",
            });
        }
        if self.reason_code.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "lock_decision.reason_code",
                reason: "must be > 0",
            });
        }
        match self.action {
            LockDecisionAction::Grant if self.granted.is_none() => {
                Err(ContractViolation::InvalidValue {
                    field: "lock_decision.granted",
                    reason: "must be present when action=GRANT",
                })
            }
            LockDecisionAction::Deny if self.held_by.is_none() => {
                Err(ContractViolation::InvalidValue {
                    field: "lock_decision.held_by",
                    reason: "must be present when action=DENY",
                })
            }
            LockDecisionAction::Remove | LockDecisionAction::NoOp
                if self.granted.is_some() || self.held_by.is_some() =>
            {
                Err(ContractViolation::InvalidValue {
                    field: "lock_decision.action",
                    reason: "REMOVE/NOOP carry no lock rows",
                })
            }
            _ => Ok(()),
        }
    }
}
