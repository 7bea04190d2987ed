#![forbid(unsafe_code)]

pub mod diff;
pub mod lock_policy;
pub mod search;
