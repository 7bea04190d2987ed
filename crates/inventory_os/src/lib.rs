#![forbid(unsafe_code)]

pub mod coordinator;
pub mod session;
