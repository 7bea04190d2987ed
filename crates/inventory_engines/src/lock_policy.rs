#![forbid(unsafe_code)]

use inventory_kernel_contracts::lock::{
    AdvisoryLock, LockDecision, LockDecisionAction, LockOperation, LockPolicyRequest, LockTimeout,
};
use inventory_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};

pub mod reason_codes {
    use inventory_kernel_contracts::ReasonCodeId;

    // Advisory lock reason-code namespace.
    pub const LOCK_OK_GRANTED: ReasonCodeId = ReasonCodeId(0x4C4B_0001);
    pub const LOCK_OK_RENEWED: ReasonCodeId = ReasonCodeId(0x4C4B_0002);
    pub const LOCK_OK_EXPIRED_TAKEOVER: ReasonCodeId = ReasonCodeId(0x4C4B_0003);
    pub const LOCK_OK_RELEASED: ReasonCodeId = ReasonCodeId(0x4C4B_0004);

    pub const LOCK_HELD_BY_OTHER: ReasonCodeId = ReasonCodeId(0x4C4B_0010);
    pub const LOCK_NOT_HELD: ReasonCodeId = ReasonCodeId(0x4C4B_0011);
}

/// Pure decision function for the advisory lock table. Stores snapshot the current row,
/// ask for a decision, then apply it; the runtime never touches storage itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockPolicyRuntime;

impl LockPolicyRuntime {
    pub fn evaluate(&self, req: &LockPolicyRequest) -> Result<LockDecision, ContractViolation> {
        req.validate()?;
        match req.operation {
            LockOperation::Acquire => self.evaluate_acquire(req),
            LockOperation::Release => self.evaluate_release(req),
        }
    }

    fn evaluate_acquire(&self, req: &LockPolicyRequest) -> Result<LockDecision, ContractViolation> {
        let live = live_lock(req.current.as_ref(), req.now, req.timeout);
        if let Some(live) = live {
            if live.holder != req.requester {
                return LockDecision::v1(
                    reason_codes::LOCK_HELD_BY_OTHER,
                    LockDecisionAction::Deny,
                    Some(live.clone()),
                    None,
                );
            }
        }

        let reason_code = match (req.current.as_ref(), live) {
            (Some(_), Some(_)) => reason_codes::LOCK_OK_RENEWED,
            (Some(_), None) => reason_codes::LOCK_OK_EXPIRED_TAKEOVER,
            (None, _) => reason_codes::LOCK_OK_GRANTED,
        };
        let granted = AdvisoryLock::v1(req.asset_id, req.requester.clone(), req.now)?;
        LockDecision::v1(reason_code, LockDecisionAction::Grant, None, Some(granted))
    }

    fn evaluate_release(&self, req: &LockPolicyRequest) -> Result<LockDecision, ContractViolation> {
        // The physical row is removed even when already expired, provided the caller holds it.
        match &req.current {
            Some(current) if current.holder == req.requester => LockDecision::v1(
                reason_codes::LOCK_OK_RELEASED,
                LockDecisionAction::Remove,
                None,
                None,
            ),
            _ => LockDecision::v1(
                reason_codes::LOCK_NOT_HELD,
                LockDecisionAction::NoOp,
                None,
                None,
            ),
        }
    }
}

/// Returns the lock only while it is unexpired; read paths must use this.
pub fn live_lock(
    current: Option<&AdvisoryLock>,
    now: MonotonicTimeNs,
    timeout: LockTimeout,
) -> Option<&AdvisoryLock> {
    current.filter(|l| !l.is_expired(now, timeout))
}
