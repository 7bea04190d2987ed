#![forbid(unsafe_code)]

pub mod asset;
pub mod common;
pub mod history;
pub mod lock;
pub mod principal;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
