//! Order-preserving key encoding.
//!
//! Each component is a type tag followed by a body whose unsigned byte order
//! matches the natural order of the type:
//!
//! ```text
//! Null      | 0 |
//! Boolean   | 1 | 0 or 1 |
//! Integer   | 2 | i64 with the sign bit flipped, big-endian |
//! Float     | 3 | IEEE bits, negatives inverted, positives with the sign bit set |
//! DateTime  | 4 | microseconds encoded like Integer |
//! String    | 5 | UTF-8 with 0x00 escaped as 0x00 0xFF | 0x00 0x00 |
//! ```
//!
//! Composite keys are the concatenation of their components, so they sort
//! component by component.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use byteorder::{BigEndian, ByteOrder};

use super::btree::MAX_INLINE_KEY_LENGTH;
use super::value::{DataType, Value};

const SIGN_BIT: u64 = 1 << 63;
const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;

fn encode_signed(value: i64, out: &mut Vec<u8>) {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value as u64 ^ SIGN_BIT);
    out.extend_from_slice(&buf);
}

fn decode_signed(bytes: &[u8]) -> i64 {
    (BigEndian::read_u64(bytes) ^ SIGN_BIT) as i64
}

fn encode_float(value: f64, out: &mut Vec<u8>) {
    let bits = value.to_bits();
    let ordered = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    };
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, ordered);
    out.extend_from_slice(&buf);
}

fn decode_float(bytes: &[u8]) -> f64 {
    let ordered = BigEndian::read_u64(bytes);
    let bits = if ordered & SIGN_BIT != 0 {
        ordered & !SIGN_BIT
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

fn encode_component(value: &Value, out: &mut Vec<u8>) {
    out.push(value.data_type() as u8);
    match value {
        Value::Null => {}
        Value::Boolean(b) => out.push(u8::from(*b)),
        Value::Integer(i) | Value::DateTime(i) => encode_signed(*i, out),
        Value::Float(x) => encode_float(*x, out),
        Value::String(s) => {
            for &byte in s.as_bytes() {
                out.push(byte);
                if byte == ESCAPE {
                    out.push(ESCAPED_ZERO);
                }
            }
            out.push(ESCAPE);
            out.push(TERMINATOR);
        }
    }
}

/// Decodes one component starting at `bytes[0]`, returning it and the number
/// of bytes consumed.
fn decode_component(bytes: &[u8]) -> Option<(Value, usize)> {
    let (&tag, body) = bytes.split_first()?;
    match DataType::from_u8(tag)? {
        DataType::Null => Some((Value::Null, 1)),
        DataType::Boolean => match *body.first()? {
            0 => Some((Value::Boolean(false), 2)),
            1 => Some((Value::Boolean(true), 2)),
            _ => None,
        },
        DataType::Integer => Some((Value::Integer(decode_signed(body.get(..8)?)), 9)),
        DataType::DateTime => Some((Value::DateTime(decode_signed(body.get(..8)?)), 9)),
        DataType::Float => Some((Value::Float(decode_float(body.get(..8)?)), 9)),
        DataType::String => {
            let mut text = Vec::new();
            let mut at = 0;
            loop {
                let byte = *body.get(at)?;
                if byte != ESCAPE {
                    text.push(byte);
                    at += 1;
                    continue;
                }
                match *body.get(at + 1)? {
                    TERMINATOR => break,
                    ESCAPED_ZERO => text.push(0),
                    _ => return None,
                }
                at += 2;
            }
            let text = String::from_utf8(text).ok()?;
            Some((Value::String(text), 1 + at + 2))
        }
    }
}

/// Borrowed view of an encoded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalisedValueSpan<'a> {
    bytes: &'a [u8],
}

impl<'a> NormalisedValueSpan<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Too long to be stored inline in a leaf slot.
    pub fn is_external(&self) -> bool {
        self.bytes.len() > MAX_INLINE_KEY_LENGTH
    }

    /// Decodes every component; `None` if the bytes are not a valid
    /// encoding.
    pub fn decode(&self) -> Option<Vec<Value>> {
        let mut values = Vec::new();
        let mut rest = self.bytes;
        while !rest.is_empty() {
            let (value, consumed) = decode_component(rest)?;
            values.push(value);
            rest = &rest[consumed..];
        }
        Some(values)
    }

    /// Whether every component of `prefix` leads this key.
    pub fn starts_with(&self, prefix: NormalisedValueSpan<'_>) -> bool {
        self.bytes.starts_with(prefix.bytes)
    }

    pub fn to_owned(&self) -> NormalisedValue {
        NormalisedValue {
            bytes: self.bytes.to_vec(),
        }
    }
}

/// An encoded key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalisedValue {
    bytes: Vec<u8>,
}

impl NormalisedValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> Self {
        let mut key = Self::new();
        key.push(value);
        key
    }

    pub fn composite(values: &[Value]) -> Self {
        let mut key = Self::new();
        for value in values {
            key.push(value);
        }
        key
    }

    /// Appends one component.
    pub fn push(&mut self, value: &Value) {
        encode_component(value, &mut self.bytes);
    }

    /// Appends raw bytes after the encoded components, such as an object id
    /// that makes otherwise equal index keys distinct.
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn span(&self) -> NormalisedValueSpan<'_> {
        NormalisedValueSpan::new(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for NormalisedValue {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Borrow<[u8]> for NormalisedValue {
    fn borrow(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<&Value> for NormalisedValue {
    fn from(value: &Value) -> Self {
        Self::from_value(value)
    }
}

impl fmt::Debug for NormalisedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span().decode() {
            Some(values) => f.debug_tuple("NormalisedValue").field(&values).finish(),
            None => f
                .debug_tuple("NormalisedValue")
                .field(&self.bytes)
                .finish(),
        }
    }
}
