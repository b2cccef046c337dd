//! # Bencode
//!
//! Binary-safe, self-delimiting value format used on the wire. Byte strings
//! carry an explicit length prefix, lists and dictionaries are delimited by
//! `l`/`d` ... `e`, integers by `i` ... `e`. Dictionary keys are written in
//! sorted order, which is what lets [`crate::messages::peek_kind`] read the
//! message type at a fixed offset.
//!
//! Decoding is strict about structure (the whole input must be consumed) and
//! bounded in nesting depth so a hostile datagram cannot blow the stack.

use std::collections::BTreeMap;
use std::fmt;

/// Maximum nesting of lists/dicts accepted by the decoder.
const MAX_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeError {
    UnexpectedEof,
    InvalidByte { pos: usize, byte: u8 },
    InvalidInteger { pos: usize },
    InvalidLength { pos: usize },
    TooDeep,
    TrailingData { pos: usize },
}

impl fmt::Display for BencodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BencodeError::UnexpectedEof => write!(f, "unexpected end of input"),
            BencodeError::InvalidByte { pos, byte } => {
                write!(f, "unexpected byte 0x{:02x} at offset {}", byte, pos)
            }
            BencodeError::InvalidInteger { pos } => write!(f, "invalid integer at offset {}", pos),
            BencodeError::InvalidLength { pos } => {
                write!(f, "invalid string length at offset {}", pos)
            }
            BencodeError::TooDeep => write!(f, "nesting deeper than {} levels", MAX_DEPTH),
            BencodeError::TrailingData { pos } => write!(f, "trailing data at offset {}", pos),
        }
    }
}

impl std::error::Error for BencodeError {}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => encode_bytes(b, out),
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (k, v) in map {
                    encode_bytes(k, out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Decode exactly one value spanning all of `data`.
    pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
        let mut parser = Parser { data, pos: 0 };
        let value = parser.value(0)?;
        if parser.pos != data.len() {
            return Err(BencodeError::TrailingData { pos: parser.pos });
        }
        Ok(value)
    }
}

fn encode_bytes(b: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(b.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(b);
}

/// Builder for dictionaries with string keys.
#[derive(Default)]
pub struct DictBuilder(BTreeMap<Vec<u8>, Value>);

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: impl AsRef<[u8]>, value: Value) -> Self {
        self.0.insert(key.as_ref().to_vec(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Dict(self.0)
    }
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let n = self.integer_until(b'e')?;
                Ok(Value::Int(n))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.byte_string()?;
                    let value = self.value(depth + 1)?;
                    map.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(map))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            byte => Err(BencodeError::InvalidByte { pos: self.pos, byte }),
        }
    }

    fn integer_until(&mut self, terminator: u8) -> Result<i64, BencodeError> {
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == terminator)
            .map(|off| start + off)
            .ok_or(BencodeError::UnexpectedEof)?;
        let digits = &self.data[start..end];
        let valid = match digits {
            [] => false,
            [b'-'] => false,
            [b'-', b'0', ..] => false,
            [b'0', _, ..] => false,
            _ => true,
        };
        let parsed = std::str::from_utf8(digits)
            .ok()
            .filter(|_| valid)
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger { pos: start })?;
        self.pos = end + 1;
        Ok(parsed)
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        match self.peek()? {
            b'0'..=b'9' => {}
            byte => return Err(BencodeError::InvalidByte { pos: start, byte }),
        }
        let len = self.integer_until(b':')?;
        let len = usize::try_from(len).map_err(|_| BencodeError::InvalidLength { pos: start })?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::InvalidLength { pos: start })?;
        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_canonical_forms() {
        assert_eq!(Value::Int(-42).encode(), b"i-42e");
        assert_eq!(Value::bytes("spam").encode(), b"4:spam");
        assert_eq!(Value::List(vec![]).encode(), b"le");
        let dict = DictBuilder::new()
            .insert("b", Value::Int(2))
            .insert("a", Value::Int(1))
            .build();
        assert_eq!(dict.encode(), b"d1:ai1e1:bi2ee");
    }

    #[test]
    fn decodes_nested_structures() {
        let raw = b"d1:0i0e1:1l4:spami7eee";
        let value = Value::decode(raw).unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get(b"0".as_slice()).and_then(Value::as_int), Some(0));
        let list = dict.get(b"1".as_slice()).and_then(Value::as_list).unwrap();
        assert_eq!(list[0].as_bytes(), Some(b"spam".as_slice()));
        assert_eq!(list[1].as_int(), Some(7));
        assert_eq!(value.encode(), raw);
    }

    #[test]
    fn byte_strings_are_binary_safe() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let encoded = Value::bytes(payload.clone()).encode();
        assert_eq!(Value::decode(&encoded).unwrap().as_bytes(), Some(payload.as_slice()));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(Value::decode(b""), Err(BencodeError::UnexpectedEof));
        assert_eq!(Value::decode(b"i12"), Err(BencodeError::UnexpectedEof));
        assert!(matches!(Value::decode(b"i-0e"), Err(BencodeError::InvalidInteger { .. })));
        assert!(matches!(Value::decode(b"i03e"), Err(BencodeError::InvalidInteger { .. })));
        assert!(matches!(Value::decode(b"ie"), Err(BencodeError::InvalidInteger { .. })));
        assert!(matches!(Value::decode(b"10:short"), Err(BencodeError::InvalidLength { .. })));
        assert!(matches!(Value::decode(b"x"), Err(BencodeError::InvalidByte { byte: b'x', .. })));
        assert!(matches!(Value::decode(b"di1ei2ee"), Err(BencodeError::InvalidByte { .. })));
        assert!(matches!(Value::decode(b"i1ei2e"), Err(BencodeError::TrailingData { pos: 3 })));
        assert_eq!(Value::decode(b"l4:spam"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn depth_is_bounded() {
        let mut deep = Vec::new();
        deep.extend(std::iter::repeat_n(b'l', MAX_DEPTH + 2));
        deep.extend(std::iter::repeat_n(b'e', MAX_DEPTH + 2));
        assert_eq!(Value::decode(&deep), Err(BencodeError::TooDeep));
    }
}
