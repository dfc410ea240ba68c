// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CredMint Protocol — Core Library
//!
//! CredMint lets an issuer buy credits and spend them on credentials that
//! are published as permanent metadata and anchored on an EVM chain by a
//! registry token. The forms and dashboards are someone else's problem;
//! this crate is the part that has to be right: the money and the
//! pipeline.
//!
//! ## Architecture
//!
//! - **ledger** — Credit accounts and the append-only entry log. Reserve,
//!   refund, purchase, adjust. Never negative, never double-spent.
//! - **credential** — Credential rows, the lifecycle state machine and row
//!   claims for the workers.
//! - **issuance** — Reserve-then-queue entry point for request handlers.
//! - **pipeline** — The relayer and the confirmation watcher, plus the
//!   scheduler that drives them.
//! - **chain** — EVM client capability: legacy transactions, JSON-RPC and a
//!   simulated chain.
//! - **signer** — Relayer keys and the signer cache.
//! - **metadata** — Metadata publishers and content addresses.
//! - **storage** — sled trees behind everything above.
//! - **config** — Pipeline constants and tunables.
//!
//! ## Ground Rules
//!
//! 1. Credits are deducted before a credential exists and refunded at most
//!    once if it fails.
//! 2. A credential is submitted to the chain at most once, however often a
//!    worker crashes. Every external side effect is checkpointed first.
//! 3. Nothing is refunded while a transaction for it might still be mined.

pub mod chain;
pub mod config;
pub mod credential;
pub mod issuance;
pub mod ledger;
pub mod metadata;
pub mod pipeline;
pub mod signer;
pub mod storage;

pub use issuance::{IssuanceError, IssuanceService};
