//! Request argument model.
//!
//! Every value a caller can put on the wire is one of the variants below.
//! Encoding is defined per variant: most render as a single length-prefixed
//! part; a [`Arg::List`] expands to one part per element, in order, so a
//! single list argument becomes several wire parts.

use serde::{Serialize, Serializer};

/// A single request argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Text, sent as raw UTF-8 bytes.
    Str(String),
    /// Raw bytes, sent verbatim.
    Bytes(Vec<u8>),
    /// Ordered text sequence; expands to one part per element.
    List(Vec<String>),
    /// Signed integer, sent as decimal ASCII.
    Int(i64),
    /// Float, sent in fixed notation with six fractional digits.
    Float(f64),
    /// Boolean, sent as `"1"` or `"0"`.
    Bool(bool),
    /// Null, sent as an empty part.
    Null,
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl From<&[u8]> for Arg {
    fn from(v: &[u8]) -> Self {
        Arg::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Bytes(v)
    }
}

impl From<Vec<String>> for Arg {
    fn from(v: Vec<String>) -> Self {
        Arg::List(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

// JSON form used by the queued-batch command, which ships buffered
// argument vectors to the server as a JSON array.
impl Serialize for Arg {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Arg::Str(v) => serializer.serialize_str(v),
            Arg::Bytes(v) => serializer.serialize_str(&String::from_utf8_lossy(v)),
            Arg::List(v) => v.serialize(serializer),
            Arg::Int(v) => serializer.serialize_i64(*v),
            Arg::Float(v) => serializer.serialize_f64(*v),
            Arg::Bool(v) => serializer.serialize_bool(*v),
            Arg::Null => serializer.serialize_unit(),
        }
    }
}
