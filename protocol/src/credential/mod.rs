//! # Credentials
//!
//! | Module          | Contents                                        |
//! |-----------------|-------------------------------------------------|
//! | `types`         | `Credential`, `CredentialStatus`, submissions   |
//! | `repository`    | persistence, lifecycle checks, row claims       |
//! | `error`         | `CredentialError`                               |

pub mod error;
pub mod repository;
pub mod types;

pub use error::CredentialError;
pub use repository::{
    ClaimRecord, ClaimedCredential, CredentialClaim, CredentialRepository, StatusCounts,
};
pub use types::{Credential, CredentialId, CredentialStatus, SignedSubmission};
