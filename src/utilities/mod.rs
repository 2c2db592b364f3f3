//! Shared helpers used by the resources and controllers

pub mod checksum;
pub mod upsert;

pub use checksum::{checksum, object_checksum, secret_checksum, string_checksum};
pub use upsert::{create_or_update, update, update_status, ConflictBackoff, OperationResult};
