//! # Storage Module
//!
//! The embedded sled database shared by the credit ledger and the
//! credential repository. Each of those owns its own row formats and keys;
//! this module only owns the trees, the bincode helpers and the schema
//! stamp.
//!
//! Bincode for on-disk rows, JSON for APIs and debugging.

pub mod db;

pub use db::{CredMintDB, DbError, DbResult};
