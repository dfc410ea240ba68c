//! # Credit Ledger Module
//!
//! ```text
//! amount.rs        — Credits: two-decimal fixed point, no floats
//! entry.rs         — Account, LedgerEntry, NewEntry, identifiers
//! store.rs         — lock-for-update guard and the atomic commit
//! credit_ledger.rs — purchase / reserve / refund / adjust / audit
//! error.rs         — LedgerError
//! ```

pub mod amount;
pub mod credit_ledger;
pub mod entry;
pub mod error;
pub mod store;

pub use amount::{Credits, ParseCreditsError};
pub use credit_ledger::{AccountAudit, CreditLedger};
pub use entry::{Account, AccountId, EntryId, EntryType, LedgerEntry, NewEntry};
pub use error::LedgerError;
pub use store::{AccountGuard, LedgerStore};
