//! Tagged values.
//!
//! Every stored value starts with one tag byte naming its kind, followed
//! by the payload:
//!
//! | tag   | kind     | payload                  |
//! |-------|----------|--------------------------|
//! | `'s'` | `Str`    | UTF-8 bytes              |
//! | `'i'` | `Int`    | 4 bytes, little-endian   |
//! | `'d'` | `Double` | 8 bytes, IEEE-754 LE     |
//! | `'b'` | `Bytes`  | raw bytes                |

use crate::error::{TypedError, TypedResult};

pub const TAG_STR: u8 = b's';
pub const TAG_INT: u8 = b'i';
pub const TAG_DOUBLE: u8 = b'd';
pub const TAG_BYTES: u8 = b'b';

/// A value as callers see it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i32),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Name of the kind, for messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Value::Str(_) => TAG_STR,
            Value::Int(_) => TAG_INT,
            Value::Double(_) => TAG_DOUBLE,
            Value::Bytes(_) => TAG_BYTES,
        }
    }

    /// Stored form: tag byte then payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.tag()];
        match self {
            Value::Str(s) => out.extend_from_slice(s.as_bytes()),
            Value::Int(n) => out.extend_from_slice(&n.to_le_bytes()),
            Value::Double(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
        }
        out
    }

    pub fn decode(stored: &[u8]) -> TypedResult<Value> {
        let (&tag, payload) = stored.split_first().ok_or(TypedError::Empty)?;
        match tag {
            TAG_STR => String::from_utf8(payload.to_vec())
                .map(Value::Str)
                .map_err(|e| TypedError::InvalidUtf8 { message: e.to_string() }),
            TAG_INT => {
                let raw: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| TypedError::BadLength { kind: "int", expected: 4, actual: payload.len() })?;
                Ok(Value::Int(i32::from_le_bytes(raw)))
            }
            TAG_DOUBLE => {
                let raw: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| TypedError::BadLength { kind: "double", expected: 8, actual: payload.len() })?;
                Ok(Value::Double(f64::from_le_bytes(raw)))
            }
            TAG_BYTES => Ok(Value::Bytes(payload.to_vec())),
            tag => Err(TypedError::UnknownTag { tag }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Double(x)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(Value::from("hi").encode(), b"shi");
        assert_eq!(Value::Int(1).encode(), vec![b'i', 1, 0, 0, 0]);
        assert_eq!(Value::Bytes(vec![]).encode(), b"b");
        assert_eq!(Value::Double(1.0).encode().len(), 9);
    }

    #[test]
    fn test_str_and_bytes_stay_distinct() {
        let s = Value::decode(&Value::from("abc").encode()).unwrap();
        let b = Value::decode(&Value::from(&b"abc"[..]).encode()).unwrap();
        assert_eq!(s.as_str(), Some("abc"));
        assert_eq!(b.as_bytes(), Some(&b"abc"[..]));
        assert_ne!(s, b);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(Value::decode(b""), Err(TypedError::Empty)));
        assert!(matches!(Value::decode(b"x123"), Err(TypedError::UnknownTag { tag: b'x' })));
        assert!(matches!(
            Value::decode(&[TAG_INT, 1, 2]),
            Err(TypedError::BadLength { kind: "int", expected: 4, actual: 2 })
        ));
        assert!(matches!(Value::decode(&[TAG_STR, 0xff, 0xfe]), Err(TypedError::InvalidUtf8 { .. })));
    }
}
