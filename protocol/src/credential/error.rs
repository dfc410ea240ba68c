//! Credential repository errors.

use thiserror::Error;

use super::types::{CredentialId, CredentialStatus};
use crate::storage::DbError;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential {0} not found")]
    NotFound(CredentialId),

    #[error("credential {0} already exists")]
    AlreadyExists(CredentialId),

    /// The lifecycle does not allow `from -> to`. Nothing was written.
    #[error("credential {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: CredentialId,
        from: CredentialStatus,
        to: CredentialStatus,
    },

    /// A checkpoint was attempted in a status that does not allow it.
    #[error("credential {id}: cannot {operation} while {status}")]
    WrongStatus {
        id: CredentialId,
        status: CredentialStatus,
        operation: &'static str,
    },

    /// A transition needs a field that has not been recorded yet.
    #[error("credential {id}: {field} is not set")]
    Incomplete {
        id: CredentialId,
        field: &'static str,
    },

    /// Another worker holds the row's lease.
    #[error("credential {0} is claimed by another worker")]
    Claimed(CredentialId),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl From<sled::Error> for CredentialError {
    fn from(e: sled::Error) -> Self {
        CredentialError::Storage(DbError::Sled(e))
    }
}
