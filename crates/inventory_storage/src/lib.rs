#![forbid(unsafe_code)]

pub mod ledger;
pub mod repo;
pub mod sqlite;
pub mod store;
