#![forbid(unsafe_code)]

use inventory_kernel_contracts::asset::{AssetId, AssetRecord};
use inventory_kernel_contracts::principal::Principal;
use inventory_kernel_contracts::ContractViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditSessionState {
    Idle,
    LockPending,
    Editing,
    Committing,
    Done,
    ConflictDetected,
    Cancelled,
}

fn is_allowed_edit_transition(from: EditSessionState, to: EditSessionState) -> bool {
    use EditSessionState::*;
    matches!(
        (from, to),
        (Idle, LockPending)
            | (LockPending, Editing)
            // Lock denied, record missing, or storage failure while entering edit.
            | (LockPending, Idle)
            | (Editing, Committing)
            | (Editing, Cancelled)
            | (Committing, Done)
            | (Committing, ConflictDetected)
            // Record vanished; the session is terminated.
            | (Committing, Idle)
            // Storage failure; the lock is still ours, so the user may retry.
            | (Committing, Editing)
            | (ConflictDetected, Idle)
            | (Cancelled, Idle)
            | (Done, Idle)
    )
}

/// One principal's attempt to edit one record.
///
/// The session owns the version captured when editing began; that version, not the advisory
/// lock, is what protects the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSession {
    principal: Principal,
    asset_id: AssetId,
    state: EditSessionState,
    snapshot: Option<AssetRecord>,
}

impl EditSession {
    pub fn new(principal: Principal, asset_id: AssetId) -> Self {
        Self {
            principal,
            asset_id,
            state: EditSessionState::Idle,
            snapshot: None,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn state(&self) -> EditSessionState {
        self.state
    }

    /// The record as read when editing began.
    pub fn snapshot(&self) -> Option<&AssetRecord> {
        self.snapshot.as_ref()
    }

    pub fn expected_version(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|r| r.version)
    }

    pub(crate) fn transition(&mut self, to: EditSessionState) -> Result<(), ContractViolation> {
        if !is_allowed_edit_transition(self.state, to) {
            return Err(ContractViolation::InvalidValue {
                field: "edit_session.state",
                reason: "transition not allowed",
            });
        }
        if matches!(to, EditSessionState::Idle) {
            self.snapshot = None;
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn capture(&mut self, record: AssetRecord) {
        self.snapshot = Some(record);
    }

    /// Finished sessions return to `Idle` before a new attempt.
    pub(crate) fn rearm(&mut self) -> Result<(), ContractViolation> {
        match self.state {
            EditSessionState::Done
            | EditSessionState::ConflictDetected
            | EditSessionState::Cancelled => self.transition(EditSessionState::Idle),
            _ => Ok(()),
        }
    }
}
