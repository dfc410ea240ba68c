//! # Solidity ABI Primitives
//!
//! Just enough of the Solidity ABI to talk to the credential registry:
//! 20-byte addresses (with EIP-55 checksums), 4-byte function selectors,
//! 32-byte event topics, and head/tail encoding for `address`, `uint256`
//! and `string` arguments.

use std::fmt;
use std::str::FromStr;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// ABI word size in bytes.
pub const WORD: usize = 32;

/// Keccak-256 digest of `data`.
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// First four bytes of the Keccak-256 of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic 0 of an event: the full Keccak-256 of its canonical signature.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Errors raised while parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must be 0x-prefixed")]
    MissingPrefix,

    #[error("address must be 40 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("address contains non-hex characters")]
    InvalidHex,

    #[error("mixed-case address fails EIP-55 checksum")]
    BadChecksum,
}

/// A 20-byte account or contract address.
///
/// Parses lowercase, uppercase, or EIP-55 mixed-case input. Mixed case is
/// only accepted when the checksum matches, which catches the classic
/// one-character typo before credits get burned on a mint to nowhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 20]);

impl Address {
    /// The zero address.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Wraps raw address bytes.
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derives an address from an uncompressed secp256k1 public key
    /// (64 bytes, without the 0x04 SEC1 prefix).
    pub fn from_public_key(uncompressed: &[u8; 64]) -> Self {
        let hash = keccak256(uncompressed);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[12..]);
        Self(bytes)
    }

    /// Reads the address out of a left-padded 32-byte ABI word or topic.
    pub fn from_word(word: &[u8; 32]) -> Self {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&word[12..]);
        Self(bytes)
    }

    /// Left-pads the address into a 32-byte ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }

    /// EIP-55 mixed-case checksum rendering.
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = keccak256(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or(AddressError::MissingPrefix)?;
        if body.len() != 40 {
            return Err(AddressError::InvalidLength(body.len()));
        }
        let decoded = hex::decode(body).map_err(|_| AddressError::InvalidHex)?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&decoded);
        let address = Address(bytes);

        let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper && address.to_checksum()[2..] != *body {
            return Err(AddressError::BadChecksum);
        }
        Ok(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// A single event log as it appears in a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Contract that emitted the event.
    pub address: Address,
    /// Indexed topics; topic 0 is the event signature hash.
    pub topics: Vec<[u8; 32]>,
    /// ABI-encoded non-indexed parameters.
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// A value that can be ABI-encoded as a function argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    String(String),
}

/// Encodes a 256-bit unsigned integer as a big-endian word.
pub fn uint_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// ABI-encodes a tuple of arguments using standard head/tail layout.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len = tokens.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        match token {
            Token::Address(addr) => head.extend_from_slice(&addr.to_word()),
            Token::Uint(value) => head.extend_from_slice(&uint_word(*value)),
            Token::String(s) => {
                let offset = U256::from(head_len + tail.len());
                head.extend_from_slice(&uint_word(offset));
                tail.extend_from_slice(&uint_word(U256::from(s.len())));
                tail.extend_from_slice(s.as_bytes());
                let pad = (WORD - s.len() % WORD) % WORD;
                tail.extend(std::iter::repeat(0u8).take(pad));
            }
        }
    }

    head.extend_from_slice(&tail);
    head
}

/// Reads the word at `index` (in words) from ABI data.
pub fn word_at(data: &[u8], index: usize) -> Option<[u8; 32]> {
    let start = index.checked_mul(WORD)?;
    let slice = data.get(start..start.checked_add(WORD)?)?;
    let mut word = [0u8; 32];
    word.copy_from_slice(slice);
    Some(word)
}

/// Decodes a dynamic `string` whose offset word sits at word `index`.
pub fn decode_string(data: &[u8], index: usize) -> Option<String> {
    let offset = U256::from_big_endian(&word_at(data, index)?);
    if offset > U256::from(data.len()) {
        return None;
    }
    let offset = offset.low_u64() as usize;
    let len_word = data.get(offset..offset.checked_add(WORD)?)?;
    let len = U256::from_big_endian(len_word);
    if len > U256::from(data.len()) {
        return None;
    }
    let len = len.low_u64() as usize;
    let start = offset + WORD;
    let bytes = data.get(start..start.checked_add(len)?)?;
    String::from_utf8(bytes.to_vec()).ok()
}
