//! # Legacy EIP-155 Transactions
//!
//! The relayer sends plain legacy transactions: widely supported, and a
//! single gas price makes same-nonce replacement rules easy to satisfy.
//!
//! ```text
//! signing hash = keccak256(rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0]))
//! raw          = rlp([nonce, gasPrice, gas, to, value, data, v, r, s])
//! v            = recovery_id + chainId * 2 + 35
//! tx hash      = keccak256(raw)
//! ```

use credmint_contracts::{keccak256, Address};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use primitive_types::U256;
use thiserror::Error;

use super::rlp::{self, Item, RlpError};
use super::TxHash;

/// Errors from decoding or verifying a raw transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("malformed transaction encoding: {0}")]
    Rlp(#[from] RlpError),

    #[error("transaction must have 9 fields, got {0}")]
    FieldCount(usize),

    #[error("contract creation is not supported")]
    MissingRecipient,

    #[error("v = {v} does not encode chain id {chain_id}")]
    ChainIdMismatch { v: u128, chain_id: u64 },

    #[error("invalid signature")]
    InvalidSignature,
}

/// Raises `price` by `percent`, and always by at least one wei so a
/// replacement is strictly more expensive.
pub fn bump_gas_price(price: u128, percent: u64) -> u128 {
    let bump = price.saturating_mul(u128::from(percent)) / 100;
    price.saturating_add(bump.max(1))
}

// ---------------------------------------------------------------------------
// UnsignedTx
// ---------------------------------------------------------------------------

/// A legacy transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl UnsignedTx {
    fn fields(&self) -> Vec<Item> {
        vec![
            Item::uint(u128::from(self.nonce)),
            Item::uint(self.gas_price),
            Item::uint(u128::from(self.gas_limit)),
            Item::bytes(self.to.as_bytes().to_vec()),
            Item::u256(self.value),
            Item::bytes(self.data.clone()),
        ]
    }

    /// EIP-155 signing hash.
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut fields = self.fields();
        fields.push(Item::uint(u128::from(self.chain_id)));
        fields.push(Item::uint(0));
        fields.push(Item::uint(0));
        keccak256(rlp::encode(&Item::List(fields)))
    }

    /// Attaches a signature over [`UnsignedTx::signing_hash`].
    pub fn into_signed(self, signature: &Signature, recovery_id: RecoveryId) -> SignedTx {
        let v = u128::from(recovery_id.to_byte())
            + u128::from(self.chain_id) * 2
            + 35;
        let bytes = signature.to_bytes();
        let r = U256::from_big_endian(&bytes[..32]);
        let s = U256::from_big_endian(&bytes[32..]);

        let mut fields = self.fields();
        fields.push(Item::uint(v));
        fields.push(Item::u256(r));
        fields.push(Item::u256(s));
        let raw = rlp::encode(&Item::List(fields));
        let hash = TxHash::of_raw(&raw);

        SignedTx {
            tx: self,
            v,
            r,
            s,
            raw,
            hash,
        }
    }
}

// ---------------------------------------------------------------------------
// SignedTx
// ---------------------------------------------------------------------------

/// A signed legacy transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub tx: UnsignedTx,
    pub v: u128,
    pub r: U256,
    pub s: U256,
    pub raw: Vec<u8>,
    pub hash: TxHash,
}

impl SignedTx {
    /// Parses raw bytes produced by [`UnsignedTx::into_signed`] (or any
    /// EIP-155 legacy transaction for `chain_id`).
    pub fn decode(raw: &[u8], chain_id: u64) -> Result<Self, TxError> {
        let item = rlp::decode(raw)?;
        let fields = item.as_list().ok_or(RlpError::ExpectedList)?;
        if fields.len() != 9 {
            return Err(TxError::FieldCount(fields.len()));
        }

        let to_bytes = fields[3].as_bytes().ok_or(RlpError::ExpectedBytes)?;
        let to: [u8; 20] = to_bytes.try_into().map_err(|_| TxError::MissingRecipient)?;
        let data = fields[5].as_bytes().ok_or(RlpError::ExpectedBytes)?.to_vec();

        let v = fields[6].as_u128()?;
        let base = u128::from(chain_id) * 2 + 35;
        if v != base && v != base + 1 {
            return Err(TxError::ChainIdMismatch { v, chain_id });
        }

        let tx = UnsignedTx {
            nonce: fields[0].as_u64()?,
            gas_price: fields[1].as_u128()?,
            gas_limit: fields[2].as_u64()?,
            to: Address::new(to),
            value: fields[4].as_u256()?,
            data,
            chain_id,
        };

        Ok(SignedTx {
            tx,
            v,
            r: fields[7].as_u256()?,
            s: fields[8].as_u256()?,
            raw: raw.to_vec(),
            hash: TxHash::of_raw(raw),
        })
    }

    /// Recovers the sender address from the signature.
    pub fn recover_sender(&self) -> Result<Address, TxError> {
        let parity = self
            .v
            .checked_sub(u128::from(self.tx.chain_id) * 2 + 35)
            .filter(|p| *p <= 1)
            .ok_or(TxError::ChainIdMismatch {
                v: self.v,
                chain_id: self.tx.chain_id,
            })?;
        let recovery_id =
            RecoveryId::from_byte(parity as u8).ok_or(TxError::InvalidSignature)?;

        let mut bytes = [0u8; 64];
        self.r.to_big_endian(&mut bytes[..32]);
        self.s.to_big_endian(&mut bytes[32..]);
        let signature =
            Signature::from_slice(&bytes).map_err(|_| TxError::InvalidSignature)?;

        let key = VerifyingKey::recover_from_prehash(
            &self.tx.signing_hash(),
            &signature,
            recovery_id,
        )
        .map_err(|_| TxError::InvalidSignature)?;
        Ok(address_of(&key))
    }
}

/// Ethereum address of a secp256k1 public key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let mut uncompressed = [0u8; 64];
    uncompressed.copy_from_slice(&point.as_bytes()[1..]);
    Address::from_public_key(&uncompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn key() -> SigningKey {
        SigningKey::from_slice(&[0x11; 32]).unwrap()
    }

    fn mint_tx(nonce: u64) -> UnsignedTx {
        UnsignedTx {
            nonce,
            gas_price: 20_000_000_000,
            gas_limit: 300_000,
            to: "0x00000000000000000000000000000000000000c0".parse().unwrap(),
            value: U256::zero(),
            data: vec![0xab; 100],
            chain_id: 31_337,
        }
    }

    fn sign(tx: UnsignedTx) -> SignedTx {
        let (sig, recid) = key().sign_prehash_recoverable(&tx.signing_hash()).unwrap();
        tx.into_signed(&sig, recid)
    }

    #[test]
    fn eip155_signing_hash_vector() {
        // The worked example from EIP-155.
        let tx = UnsignedTx {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: "0x3535353535353535353535353535353535353535".parse().unwrap(),
            value: U256::from(1_000_000_000_000_000_000u128),
            data: vec![],
            chain_id: 1,
        };
        assert_eq!(
            hex::encode(tx.signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn v_encodes_chain_id() {
        let signed = sign(mint_tx(0));
        assert!(signed.v == 31_337 * 2 + 35 || signed.v == 31_337 * 2 + 36);
    }

    #[test]
    fn decode_recovers_fields_and_sender() {
        let signed = sign(mint_tx(7));
        let decoded = SignedTx::decode(&signed.raw, 31_337).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(
            decoded.recover_sender().unwrap(),
            address_of(key().verifying_key())
        );
    }

    #[test]
    fn decode_rejects_wrong_chain() {
        let signed = sign(mint_tx(0));
        assert!(matches!(
            SignedTx::decode(&signed.raw, 1),
            Err(TxError::ChainIdMismatch { .. })
        ));
    }

    #[test]
    fn hash_is_keccak_of_raw() {
        let signed = sign(mint_tx(1));
        assert_eq!(signed.hash, TxHash::of_raw(&signed.raw));
        assert_ne!(sign(mint_tx(2)).hash, signed.hash);
    }

    #[test]
    fn gas_bump_is_strictly_increasing() {
        assert_eq!(bump_gas_price(1_000, 10), 1_100);
        assert_eq!(bump_gas_price(5, 10), 6);
        assert_eq!(bump_gas_price(0, 10), 1);
        assert_eq!(bump_gas_price(u128::MAX, 10), u128::MAX);
    }
}
