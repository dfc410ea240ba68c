//! Credit ledger errors.

use thiserror::Error;

use super::amount::Credits;
use super::entry::AccountId;
use crate::storage::DbError;

/// Errors returned by the credit ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The balance does not cover the requested amount. Nothing was written.
    #[error("insufficient credits on {account}: available {available}, requested {requested}")]
    InsufficientCredits {
        account: AccountId,
        available: Credits,
        requested: Credits,
    },

    /// A purchase with this payment reference was already recorded.
    #[error("payment reference '{0}' already recorded")]
    DuplicatePayment(String),

    #[error("payment reference is required")]
    MissingPaymentReference,

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    /// Amounts must be strictly positive (adjustments: non-zero).
    #[error("invalid amount {0}")]
    InvalidAmount(Credits),

    /// The new balance does not fit in the fixed-point range.
    #[error("balance overflow on account {0}")]
    Overflow(AccountId),

    /// The account row changed underneath a held lock. Only possible if
    /// something bypassed the ledger and wrote the row directly.
    #[error("account {0} was modified concurrently")]
    ConcurrentModification(AccountId),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl From<sled::Error> for LedgerError {
    fn from(e: sled::Error) -> Self {
        LedgerError::Storage(DbError::Sled(e))
    }
}
