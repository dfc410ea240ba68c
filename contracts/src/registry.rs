//! # Credential Registry Contract
//!
//! The registry mints one non-transferable token per credential. Two pieces
//! of its ABI matter off-chain:
//!
//! - the **mint function**, called by the relayer with the recipient and the
//!   metadata URI (`mint(address,string)` by default);
//! - the **mint event**, whose first indexed parameter carries the newly
//!   minted token id (`CredentialMinted(uint256,address,string)` by default,
//!   with `tokenId` and `recipient` indexed).
//!
//! Both signatures come from configuration. [`MintAbi::new`] parses them and
//! refuses anything whose argument shape we can't encode, so a bad deploy
//! config fails at startup instead of at the first mint.

use primitive_types::U256;
use thiserror::Error;

use crate::abi::{self, Address, Log, Token};

/// Default canonical signature of the registry's mint function.
pub const DEFAULT_MINT_FUNCTION: &str = "mint(address,string)";

/// Default canonical signature of the registry's mint event.
pub const DEFAULT_MINT_EVENT: &str = "CredentialMinted(uint256,address,string)";

/// Errors from building calldata or decoding registry events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The configured signature is not of the form `name(type,...)`.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The mint function's parameters are not `(address,string)`.
    #[error("unsupported mint function parameters {0:?}; expected (address,string)")]
    UnsupportedMintParams(Vec<String>),

    /// The mint event's first parameter is not a `uint256` token id.
    #[error("mint event must start with a uint256 token id, got {0:?}")]
    UnsupportedEventParams(Vec<String>),

    /// No log in the receipt matched the mint event emitted by the registry.
    #[error("no mint event from {contract} among {log_count} logs")]
    EventNotFound {
        /// Registry address that should have emitted the event.
        contract: Address,
        /// How many logs the receipt carried.
        log_count: usize,
    },

    /// The matching log lacks the indexed token id topic.
    #[error("mint event is missing its indexed token id topic")]
    MissingTokenTopic,
}

// ---------------------------------------------------------------------------
// Signature parsing
// ---------------------------------------------------------------------------

/// A parsed canonical signature: `name(type1,type2,...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    canonical: String,
    name: String,
    params: Vec<String>,
}

impl Signature {
    fn parse(raw: &str) -> Result<Self, RegistryError> {
        let canonical: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let open = canonical
            .find('(')
            .ok_or_else(|| RegistryError::MalformedSignature(raw.to_string()))?;
        if !canonical.ends_with(')') || open == 0 {
            return Err(RegistryError::MalformedSignature(raw.to_string()));
        }
        let name = canonical[..open].to_string();
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RegistryError::MalformedSignature(raw.to_string()));
        }
        let inner = &canonical[open + 1..canonical.len() - 1];
        let params = if inner.is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(str::to_string).collect()
        };
        Ok(Self {
            canonical,
            name,
            params,
        })
    }
}

// ---------------------------------------------------------------------------
// MintAbi
// ---------------------------------------------------------------------------

/// A token minted by the registry, as decoded from its mint event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedEvent {
    /// The minted token id (first indexed event parameter).
    pub token_id: U256,
    /// The recipient, when the event indexes it as the second parameter.
    pub recipient: Option<Address>,
}

/// The registry ABI surface used by the pipeline.
#[derive(Debug, Clone)]
pub struct MintAbi {
    function: Signature,
    event: Signature,
    selector: [u8; 4],
    event_topic: [u8; 32],
}

impl MintAbi {
    /// Builds the ABI from configured function and event signatures.
    pub fn new(function: &str, event: &str) -> Result<Self, RegistryError> {
        let function = Signature::parse(function)?;
        if function.params != ["address", "string"] {
            return Err(RegistryError::UnsupportedMintParams(function.params));
        }
        let event = Signature::parse(event)?;
        if event.params.first().map(String::as_str) != Some("uint256") {
            return Err(RegistryError::UnsupportedEventParams(event.params));
        }
        let selector = abi::selector(&function.canonical);
        let event_topic = abi::event_topic(&event.canonical);
        Ok(Self {
            function,
            event,
            selector,
            event_topic,
        })
    }

    /// Name of the mint function, for logs.
    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    /// Canonical mint function signature.
    pub fn function_signature(&self) -> &str {
        &self.function.canonical
    }

    /// Canonical mint event signature.
    pub fn event_signature(&self) -> &str {
        &self.event.canonical
    }

    /// Four-byte selector of the mint function.
    pub fn selector(&self) -> [u8; 4] {
        self.selector
    }

    /// Topic 0 of the mint event.
    pub fn event_topic(&self) -> [u8; 32] {
        self.event_topic
    }

    /// Builds calldata for minting a credential to `recipient` with the
    /// given metadata URI.
    pub fn encode_mint(&self, recipient: &Address, metadata_uri: &str) -> Vec<u8> {
        let args = abi::encode(&[
            Token::Address(*recipient),
            Token::String(metadata_uri.to_string()),
        ]);
        let mut calldata = Vec::with_capacity(4 + args.len());
        calldata.extend_from_slice(&self.selector);
        calldata.extend_from_slice(&args);
        calldata
    }

    /// Builds the log the registry emits for a mint. Used by the simulated
    /// chain so its receipts look exactly like the real contract's.
    pub fn minted_log(
        &self,
        contract: Address,
        token_id: U256,
        recipient: Address,
        uri: &str,
    ) -> Log {
        Log {
            address: contract,
            topics: vec![self.event_topic, abi::uint_word(token_id), recipient.to_word()],
            data: abi::encode(&[Token::String(uri.to_string())]),
        }
    }

    /// Finds the mint event emitted by `contract` among `logs` and extracts
    /// the token id from its first indexed topic.
    ///
    /// Logs from other contracts, or with other topics, are ignored.
    pub fn decode_minted(
        &self,
        contract: &Address,
        logs: &[Log],
    ) -> Result<MintedEvent, RegistryError> {
        let log = logs
            .iter()
            .find(|log| {
                log.address == *contract && log.topics.first() == Some(&self.event_topic)
            })
            .ok_or(RegistryError::EventNotFound {
                contract: *contract,
                log_count: logs.len(),
            })?;

        let token_topic = log.topics.get(1).ok_or(RegistryError::MissingTokenTopic)?;
        let token_id = U256::from_big_endian(token_topic);
        let recipient = log.topics.get(2).map(Address::from_word);

        Ok(MintedEvent {
            token_id,
            recipient,
        })
    }
}

impl Default for MintAbi {
    fn default() -> Self {
        // The defaults are compile-time constants that satisfy `new`'s checks.
        match Self::new(DEFAULT_MINT_FUNCTION, DEFAULT_MINT_EVENT) {
            Ok(abi) => abi,
            Err(e) => unreachable!("default registry ABI is invalid: {e}"),
        }
    }
}
