//! # CredMint Contract Bindings
//!
//! Off-chain bindings for the credential registry contract that anchors every
//! CredMint credential as a soulbound token. The relayer uses this crate to
//! build mint calldata; the confirmation watcher uses it to pull the minted
//! token id back out of the receipt logs.
//!
//! - **abi** — Solidity ABI primitives: addresses, selectors, topics, word
//!   encoding for the handful of types the registry actually uses.
//! - **registry** — The registry's mint function and mint event, with the
//!   signatures supplied by configuration rather than baked in.
//!
//! ## Design Principles
//!
//! 1. The contract ABI is an external contract. Defaults exist, but the
//!    deployment decides the signatures and this crate only validates that
//!    they have a shape we know how to encode.
//! 2. No ABI code generation, no JSON ABI files. The surface is two calls
//!    wide and hand-rolled encoding keeps it auditable.
//! 3. Every decode path returns an error instead of panicking on short or
//!    malformed input. Receipts come from the network; treat them as hostile.

pub mod abi;
pub mod registry;

pub use abi::{keccak256, Address, AddressError, Log};
pub use registry::{MintAbi, MintedEvent, RegistryError};
