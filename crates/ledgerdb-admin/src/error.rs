//! A dedicated error type for the admin crate, grounded on the
//! teacher's `sombra-admin::AdminError` — administrative tooling
//! reports its own taxonomy rather than reusing the main storage
//! `Status` enum directly, since callers here are operators and
//! scripts, not page clients.

#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    #[error("storage error: {0}")]
    Storage(#[from] ledgerdb_types::Status),
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

pub type Result<T> = std::result::Result<T, AdminError>;
