//! Bencode codec
//!
//! Strict decoder and canonical encoder for the bencoding used by KRPC,
//! ut_metadata and the extension handshake.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`
//!
//! Decoding is strict: no leading zeros, no `-0`, dictionary keys must be
//! unique and sorted. Nesting depth is bounded since every input reaching
//! this module comes from the network.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Maximum allowed length for a bencode string (100 MiB)
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// Maximum list/dict nesting accepted from the wire
const MAX_DEPTH: usize = 64;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte string keys (sorted by key)
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 40 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let mut map = f.debug_map();
                for (k, v) in d {
                    map.entry(&String::from_utf8_lossy(k), v);
                }
                map.finish()
            }
        }
    }
}

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}

/// Cursor over an input buffer
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(parse_error(format!(
                "Expected {:?} at offset {}, found {:?}",
                byte as char, self.pos, b as char
            ))),
            None => Err(parse_error("Unexpected end of input")),
        }
    }

    /// Consume bytes up to (not including) `delim`, then skip it
    fn take_until(&mut self, delim: u8) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&c| c == delim)
            .ok_or_else(|| parse_error(format!("Missing {:?} terminator", delim as char)))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(parse_error("Nesting too deep"));
        }
        match self.peek() {
            None => Err(parse_error("Empty input")),
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(b'0'..=b'9') => self.bytes().map(|b| BencodeValue::Bytes(b.to_vec())),
            Some(c) => Err(parse_error(format!(
                "Invalid bencode type marker: {:?}",
                c as char
            ))),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        self.expect(b'i')?;
        let digits = self.take_until(b'e')?;
        let text = std::str::from_utf8(digits).map_err(|_| parse_error("Invalid integer encoding"))?;

        let unsigned = text.strip_prefix('-').unwrap_or(text);
        if unsigned.is_empty() || !unsigned.bytes().all(|c| c.is_ascii_digit()) {
            return Err(parse_error(format!("Invalid integer: {:?}", text)));
        }
        if unsigned.len() > 1 && unsigned.starts_with('0') {
            return Err(parse_error("Invalid integer: leading zero"));
        }
        if text == "-0" {
            return Err(parse_error("Invalid integer: negative zero"));
        }

        text.parse::<i64>()
            .map(BencodeValue::Integer)
            .map_err(|_| parse_error("Integer out of range"))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len_digits = self.take_until(b':')?;
        let len = std::str::from_utf8(len_digits)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| parse_error("Invalid string length"))?;

        if len > MAX_STRING_LENGTH {
            return Err(parse_error(format!(
                "String length {} exceeds maximum allowed {} bytes",
                len, MAX_STRING_LENGTH
            )));
        }

        let available = self.data.len() - self.pos;
        if len > available {
            return Err(parse_error(format!(
                "String length {} exceeds available data {}",
                len, available
            )));
        }

        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(parse_error("Unterminated list")),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::List(items));
                }
                Some(_) => items.push(self.value(depth + 1)?),
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<BencodeValue> {
        self.expect(b'd')?;
        let mut items = BTreeMap::new();
        let mut last_key: Option<&[u8]> = None;
        loop {
            match self.peek() {
                None => return Err(parse_error("Unterminated dict")),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::Dict(items));
                }
                Some(b'0'..=b'9') => {
                    let key = self.bytes()?;
                    if last_key.is_some_and(|last| key <= last) {
                        return Err(parse_error("Dict keys not in sorted order"));
                    }
                    last_key = Some(key);
                    let value = self.value(depth + 1)?;
                    items.insert(key.to_vec(), value);
                }
                Some(_) => return Err(parse_error("Dict key must be a string")),
            }
        }
    }
}

impl BencodeValue {
    /// Decode one value from the front of `data`.
    ///
    /// Returns the value and the number of bytes it occupied; anything after
    /// that is left to the caller (ut_metadata carries raw piece data there).
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize)> {
        let mut decoder = Decoder { data, pos: 0 };
        let value = decoder.value(0)?;
        Ok((value, decoder.pos))
    }

    /// Decode a complete value, rejecting trailing data
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (value, consumed) = Self::decode_prefix(data)?;
        if consumed != data.len() {
            return Err(parse_error(format!(
                "Trailing data: {} bytes",
                data.len() - consumed
            )));
        }
        Ok(value)
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Encode to an existing buffer
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => encode_bytes(b, buf),
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    encode_bytes(k, buf);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Empty dictionary, for building messages
    pub fn new_dict() -> Self {
        Self::Dict(BTreeMap::new())
    }

    /// Insert into a dictionary value; no-op on other variants
    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl Into<BencodeValue>) {
        if let Self::Dict(d) = self {
            d.insert(key.as_ref().to_vec(), value.into());
        }
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, key: impl AsRef<[u8]>, value: impl Into<BencodeValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Get as string (UTF-8)
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }

    /// Check if this is a dict
    pub fn is_dict(&self) -> bool {
        matches!(self, Self::Dict(_))
    }
}

fn encode_bytes(b: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(b.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(b);
}

impl From<i64> for BencodeValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<u64> for BencodeValue {
    fn from(n: u64) -> Self {
        Self::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<usize> for BencodeValue {
    fn from(n: usize) -> Self {
        Self::from(n as u64)
    }
}

impl From<&str> for BencodeValue {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for BencodeValue {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<BencodeValue>> for BencodeValue {
    fn from(l: Vec<BencodeValue>) -> Self {
        Self::List(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integer() {
        assert_eq!(BencodeValue::decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(BencodeValue::decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(BencodeValue::decode(b"i0e").unwrap(), BencodeValue::Integer(0));

        assert!(BencodeValue::decode(b"i03e").is_err());
        assert!(BencodeValue::decode(b"i-0e").is_err());
        assert!(BencodeValue::decode(b"i-03e").is_err());
        assert!(BencodeValue::decode(b"ie").is_err());
        assert!(BencodeValue::decode(b"i4x2e").is_err());
    }

    #[test]
    fn test_decode_bytes() {
        assert_eq!(
            BencodeValue::decode(b"4:spam").unwrap(),
            BencodeValue::Bytes(b"spam".to_vec())
        );
        assert_eq!(BencodeValue::decode(b"0:").unwrap(), BencodeValue::Bytes(vec![]));
        assert_eq!(
            BencodeValue::decode(b"5:\x00\x01\x02\x03\x04").unwrap(),
            BencodeValue::Bytes(vec![0, 1, 2, 3, 4])
        );
        assert!(BencodeValue::decode(b"10:short").is_err());
    }

    #[test]
    fn test_decode_dict_strictness() {
        let value = BencodeValue::decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(value.get("cow").and_then(|v| v.as_string()), Some("moo"));

        // Unsorted and duplicate keys are rejected
        assert!(BencodeValue::decode(b"d4:spam4:eggs3:cow3:mooe").is_err());
        assert!(BencodeValue::decode(b"d3:cow3:moo3:cow3:mooe").is_err());
        // Non-string key
        assert!(BencodeValue::decode(b"di1e3:mooe").is_err());
        assert!(BencodeValue::decode(b"d3:cow3:moo").is_err());
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let data = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        let (value, consumed) = BencodeValue::decode_prefix(data).unwrap();
        assert!(value.is_dict());
        assert_eq!(&data[consumed..], b"RAWDATA");
        assert!(BencodeValue::decode(data).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut deep = vec![b'l'; MAX_DEPTH + 2];
        deep.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(BencodeValue::decode(&deep).is_err());

        let mut ok = vec![b'l'; 8];
        ok.extend(vec![b'e'; 8]);
        assert!(BencodeValue::decode(&ok).is_ok());
    }

    #[test]
    fn test_builder_encodes_sorted() {
        let value = BencodeValue::new_dict()
            .with("y", "q")
            .with("t", "aa")
            .with("a", BencodeValue::new_dict().with("id", &b"abcdefghij0123456789"[..]));
        assert_eq!(
            value.encode(),
            b"d1:ad2:id20:abcdefghij0123456789e1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn test_reencode_is_canonical() {
        let original = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";
        let value = BencodeValue::decode(original).unwrap();
        assert_eq!(value.encode(), original.to_vec());
        assert_eq!(value.get("value").and_then(|v| v.as_uint()), Some(42));
        assert_eq!(value.get("items").and_then(|v| v.as_list()).map(|l| l.len()), Some(3));
    }
}
