//! Order-preserving index key encoding.
//!
//! Each field is a type tag followed by its payload. Byte-wise comparison of
//! two encodings with the same field count agrees with comparison of the
//! decoded keys, and no encoding is a prefix of another, so an entry's
//! record id can be appended directly after its key.
//!
//! | Field    | Tag    | Payload                                         |
//! |----------|--------|-------------------------------------------------|
//! | MinKey   | `0x01` | none                                            |
//! | Null     | `0x05` | none                                            |
//! | Bool     | `0x10` | `0x00` / `0x01`                                 |
//! | Int      | `0x20` | 8 bytes big-endian with the sign bit flipped    |
//! | Str      | `0x30` | bytes with `0x00` escaped as `0x00 0xFF`, then `0x00 0x00` |
//! | MaxKey   | `0xF0` | none                                            |

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Largest encoded key accepted by an index.
pub const MAX_KEY_BYTES: usize = 1024;

const TAG_MIN_KEY: u8 = 0x01;
const TAG_NULL: u8 = 0x05;
const TAG_BOOL: u8 = 0x10;
const TAG_INT: u8 = 0x20;
const TAG_STR: u8 = 0x30;
const TAG_MAX_KEY: u8 = 0xF0;

const SIGN_BIT: u64 = 1 << 63;

/// One field of an index key, ordered as encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyField {
    /// Sorts before every other value.
    MinKey,
    /// Null or missing.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A UTF-8 string.
    Str(String),
    /// Sorts after every other value.
    MaxKey,
}

impl KeyField {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::MinKey => out.push(TAG_MIN_KEY),
            Self::Null => out.push(TAG_NULL),
            Self::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            Self::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&((*i as u64) ^ SIGN_BIT).to_be_bytes());
            }
            Self::Str(s) => {
                out.push(TAG_STR);
                for &byte in s.as_bytes() {
                    out.push(byte);
                    if byte == 0 {
                        out.push(0xFF);
                    }
                }
                out.extend_from_slice(&[0, 0]);
            }
            Self::MaxKey => out.push(TAG_MAX_KEY),
        }
    }

    fn decode(bytes: &[u8]) -> CoreResult<(Self, usize)> {
        let truncated = || CoreError::type_mismatch("truncated index key");
        let (&tag, rest) = bytes.split_first().ok_or_else(truncated)?;
        match tag {
            TAG_MIN_KEY => Ok((Self::MinKey, 1)),
            TAG_NULL => Ok((Self::Null, 1)),
            TAG_MAX_KEY => Ok((Self::MaxKey, 1)),
            TAG_BOOL => match rest.first() {
                Some(0) => Ok((Self::Bool(false), 2)),
                Some(1) => Ok((Self::Bool(true), 2)),
                Some(other) => Err(CoreError::type_mismatch(format!(
                    "invalid boolean byte {other:#04x} in index key"
                ))),
                None => Err(truncated()),
            },
            TAG_INT => {
                let raw: [u8; 8] = rest
                    .get(..8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(truncated)?;
                Ok((Self::Int((u64::from_be_bytes(raw) ^ SIGN_BIT) as i64), 9))
            }
            TAG_STR => {
                let mut out = Vec::new();
                let mut i = 0;
                loop {
                    match (rest.get(i), rest.get(i + 1)) {
                        (Some(0), Some(0)) => break,
                        (Some(0), Some(0xFF)) => {
                            out.push(0);
                            i += 2;
                        }
                        (Some(0), _) | (None, _) => return Err(truncated()),
                        (Some(&byte), _) => {
                            out.push(byte);
                            i += 1;
                        }
                    }
                }
                let s = String::from_utf8(out)
                    .map_err(|_| CoreError::type_mismatch("index key string is not UTF-8"))?;
                Ok((Self::Str(s), 1 + i + 2))
            }
            other => Err(CoreError::type_mismatch(format!(
                "unknown index key tag {other:#04x}"
            ))),
        }
    }
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinKey => f.write_str("MinKey"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::MaxKey => f.write_str("MaxKey"),
        }
    }
}

impl From<&str> for KeyField {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeyField {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeyField {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for KeyField {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A compound index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IndexKey {
    fields: Vec<KeyField>,
}

impl IndexKey {
    /// Creates a key from its fields.
    #[must_use]
    pub fn new(fields: Vec<KeyField>) -> Self {
        Self { fields }
    }

    /// Creates a single-field key.
    pub fn single(field: impl Into<KeyField>) -> Self {
        Self {
            fields: vec![field.into()],
        }
    }

    /// Returns the fields.
    #[must_use]
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the key has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encodes the key.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode_fields(&self.fields)
    }

    /// Decodes a key of `field_count` fields from the front of `bytes`,
    /// returning the key and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` for malformed input.
    pub fn decode_prefix(bytes: &[u8], field_count: usize) -> CoreResult<(Self, usize)> {
        let mut fields = Vec::with_capacity(field_count);
        let mut offset = 0;
        for _ in 0..field_count {
            let (field, used) = KeyField::decode(&bytes[offset..])?;
            fields.push(field);
            offset += used;
        }
        Ok((Self { fields }, offset))
    }

    /// Renders the key with field names, as in `{ a: "x", b: 1 }`.
    #[must_use]
    pub fn render(&self, names: &[String]) -> String {
        let parts: Vec<String> = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, field)| match names.get(i) {
                Some(name) => format!("{name}: {field}"),
                None => format!(": {field}"),
            })
            .collect();
        format!("{{ {} }}", parts.join(", "))
    }
}

impl FromIterator<KeyField> for IndexKey {
    fn from_iter<I: IntoIterator<Item = KeyField>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&[]))
    }
}

/// Encodes a sequence of fields.
#[must_use]
pub fn encode_fields(fields: &[KeyField]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in fields {
        field.encode_into(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn field() -> impl Strategy<Value = KeyField> {
        prop_oneof![
            Just(KeyField::MinKey),
            Just(KeyField::Null),
            any::<bool>().prop_map(KeyField::Bool),
            any::<i64>().prop_map(KeyField::Int),
            "[a-c\\x00]{0,4}".prop_map(KeyField::Str),
            Just(KeyField::MaxKey),
        ]
    }

    fn key(fields: usize) -> impl Strategy<Value = IndexKey> {
        proptest::collection::vec(field(), fields).prop_map(IndexKey::new)
    }

    #[test]
    fn type_order() {
        let ordered = [
            KeyField::MinKey,
            KeyField::Null,
            KeyField::Bool(true),
            KeyField::Int(i64::MIN),
            KeyField::Int(-1),
            KeyField::Int(0),
            KeyField::Int(i64::MAX),
            KeyField::Str(String::new()),
            KeyField::Str("\0".into()),
            KeyField::Str("a".into()),
            KeyField::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert!(
                encode_fields(&pair[..1]) < encode_fields(&pair[1..]),
                "{} !< {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn decode_stops_after_field_count() {
        let key = IndexKey::new(vec!["a\0b".into(), 7.into()]);
        let mut bytes = key.encode();
        bytes.extend_from_slice(&[0xAA; 8]);
        let (decoded, used) = IndexKey::decode_prefix(&bytes, 2).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(used, bytes.len() - 8);
    }

    #[test]
    fn malformed_input() {
        assert!(IndexKey::decode_prefix(&[0x99], 1).is_err());
        assert!(IndexKey::decode_prefix(&[TAG_STR, b'a', 0], 1).is_err());
        assert!(IndexKey::decode_prefix(&[TAG_INT, 1, 2], 1).is_err());
        assert!(IndexKey::decode_prefix(&[], 1).is_err());
    }

    #[test]
    fn render_with_names() {
        let key = IndexKey::new(vec!["a".into(), 1.into()]);
        assert_eq!(key.render(&["x".into(), "y".into()]), "{ x: \"a\", y: 1 }");
        assert_eq!(key.to_string(), "{ : \"a\", : 1 }");
    }

    proptest! {
        #[test]
        fn encoding_preserves_order(a in key(2), b in key(2)) {
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
        }

        #[test]
        fn decode_inverts_encode(k in key(3)) {
            let bytes = k.encode();
            let (decoded, used) = IndexKey::decode_prefix(&bytes, 3).unwrap();
            prop_assert_eq!(used, bytes.len());
            prop_assert_eq!(decoded, k);
        }
    }
}
