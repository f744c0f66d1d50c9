#![forbid(unsafe_code)]
//! Administrative tooling for ledgerdb: page usage tracking and
//! least-recently-used disk cleanup (spec §4.7).

mod cleanup;
mod error;
mod usage_db;

pub use cleanup::{CleanupReport, DiskCleanupManager, EvictionDelegate};
pub use error::{AdminError, Result};
pub use usage_db::{PageUsageDb, UsageEntry};
