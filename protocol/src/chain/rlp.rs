//! Recursive Length Prefix encoding.
//!
//! Only what legacy transactions need: byte strings, unsigned integers as
//! minimal big-endian byte strings, and flat or nested lists.

use primitive_types::U256;
use thiserror::Error;

/// An RLP item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    List(Vec<Item>),
}

impl Item {
    pub fn uint(value: u128) -> Self {
        Item::Bytes(trim_leading_zeros(&value.to_be_bytes()).to_vec())
    }

    pub fn u256(value: U256) -> Self {
        let mut word = [0u8; 32];
        value.to_big_endian(&mut word);
        Item::Bytes(trim_leading_zeros(&word).to_vec())
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Item::Bytes(data.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Item::Bytes(b) => Some(b),
            Item::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            Item::Bytes(_) => None,
        }
    }

    /// Reads the item as an unsigned integer of at most 16 bytes.
    pub fn as_u128(&self) -> Result<u128, RlpError> {
        let bytes = self.as_bytes().ok_or(RlpError::ExpectedBytes)?;
        if bytes.len() > 16 {
            return Err(RlpError::IntegerOverflow);
        }
        if bytes.first() == Some(&0) {
            return Err(RlpError::NonCanonical);
        }
        Ok(bytes.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
    }

    pub fn as_u64(&self) -> Result<u64, RlpError> {
        u64::try_from(self.as_u128()?).map_err(|_| RlpError::IntegerOverflow)
    }

    pub fn as_u256(&self) -> Result<U256, RlpError> {
        let bytes = self.as_bytes().ok_or(RlpError::ExpectedBytes)?;
        if bytes.len() > 32 {
            return Err(RlpError::IntegerOverflow);
        }
        if bytes.first() == Some(&0) {
            return Err(RlpError::NonCanonical);
        }
        Ok(U256::from_big_endian(bytes))
    }
}

/// Decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RlpError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("trailing bytes after item")]
    Trailing,
    #[error("non-canonical encoding")]
    NonCanonical,
    #[error("expected a byte string")]
    ExpectedBytes,
    #[error("expected a list")]
    ExpectedList,
    #[error("integer does not fit")]
    IntegerOverflow,
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes an item.
pub fn encode(item: &Item) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(item, &mut out);
    out
}

fn encode_into(item: &Item, out: &mut Vec<u8>) {
    match item {
        Item::Bytes(data) => {
            if data.len() == 1 && data[0] < 0x80 {
                out.push(data[0]);
            } else {
                write_header(out, 0x80, data.len());
                out.extend_from_slice(data);
            }
        }
        Item::List(items) => {
            let mut payload = Vec::new();
            for item in items {
                encode_into(item, &mut payload);
            }
            write_header(out, 0xc0, payload.len());
            out.extend_from_slice(&payload);
        }
    }
}

fn write_header(out: &mut Vec<u8>, offset: u8, len: usize) {
    if len < 56 {
        out.push(offset + len as u8);
    } else {
        let len_bytes = (len as u64).to_be_bytes();
        let len_bytes = trim_leading_zeros(&len_bytes);
        out.push(offset + 55 + len_bytes.len() as u8);
        out.extend_from_slice(len_bytes);
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decodes exactly one item spanning all of `data`.
pub fn decode(data: &[u8]) -> Result<Item, RlpError> {
    let (item, used) = decode_one(data)?;
    if used != data.len() {
        return Err(RlpError::Trailing);
    }
    Ok(item)
}

fn decode_one(data: &[u8]) -> Result<(Item, usize), RlpError> {
    let prefix = *data.first().ok_or(RlpError::Truncated)?;
    match prefix {
        0x00..=0x7f => Ok((Item::Bytes(vec![prefix]), 1)),
        0x80..=0xbf => {
            let (header, len) = read_header(data, 0x80)?;
            let end = header.checked_add(len).ok_or(RlpError::Truncated)?;
            let body = data.get(header..end).ok_or(RlpError::Truncated)?;
            if len == 1 && body[0] < 0x80 {
                return Err(RlpError::NonCanonical);
            }
            Ok((Item::Bytes(body.to_vec()), end))
        }
        0xc0..=0xff => {
            let (header, len) = read_header(data, 0xc0)?;
            let end = header.checked_add(len).ok_or(RlpError::Truncated)?;
            let mut body = data.get(header..end).ok_or(RlpError::Truncated)?;
            let mut items = Vec::new();
            while !body.is_empty() {
                let (item, used) = decode_one(body)?;
                items.push(item);
                body = &body[used..];
            }
            Ok((Item::List(items), end))
        }
    }
}

/// Returns `(header length, payload length)`.
fn read_header(data: &[u8], offset: u8) -> Result<(usize, usize), RlpError> {
    let short = data[0] - offset;
    if short < 56 {
        return Ok((1, short as usize));
    }
    let len_of_len = (short - 55) as usize;
    let len_bytes = data.get(1..1 + len_of_len).ok_or(RlpError::Truncated)?;
    if len_bytes.first() == Some(&0) || len_of_len > 8 {
        return Err(RlpError::NonCanonical);
    }
    let len = len_bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    if len < 56 {
        return Err(RlpError::NonCanonical);
    }
    let len = usize::try_from(len).map_err(|_| RlpError::Truncated)?;
    Ok((1 + len_of_len, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // From the Ethereum wiki RLP examples.
        assert_eq!(encode(&Item::bytes(b"dog".to_vec())), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(
            encode(&Item::List(vec![Item::bytes(b"cat".to_vec()), Item::bytes(b"dog".to_vec())])),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
        assert_eq!(encode(&Item::bytes(Vec::new())), vec![0x80]);
        assert_eq!(encode(&Item::List(vec![])), vec![0xc0]);
        assert_eq!(encode(&Item::uint(0)), vec![0x80]);
        assert_eq!(encode(&Item::uint(15)), vec![0x0f]);
        assert_eq!(encode(&Item::uint(1024)), vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn long_string_header() {
        let data = vec![b'a'; 56];
        let encoded = encode(&Item::bytes(data.clone()));
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(decode(&encoded).unwrap(), Item::Bytes(data));
    }

    #[test]
    fn nested_list_decodes() {
        let item = Item::List(vec![
            Item::uint(9),
            Item::List(vec![Item::bytes(vec![0xff; 70])]),
            Item::u256(U256::from(1_000_000u64)),
        ]);
        let decoded = decode(&encode(&item)).unwrap();
        let list = decoded.as_list().unwrap();
        assert_eq!(list[0].as_u64().unwrap(), 9);
        assert_eq!(list[2].as_u256().unwrap(), U256::from(1_000_000u64));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(decode(&[]), Err(RlpError::Truncated));
        assert_eq!(decode(&[0x83, b'd']), Err(RlpError::Truncated));
        assert_eq!(decode(&[0x81, 0x05]), Err(RlpError::NonCanonical));
        assert_eq!(decode(&[0x05, 0x06]), Err(RlpError::Trailing));
        assert_eq!(Item::bytes(vec![0, 1]).as_u64(), Err(RlpError::NonCanonical));
    }
}
