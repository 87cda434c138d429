//! Typed decoding of response frames.
//!
//! The payload shape of a successful response is a property of the command
//! that produced it, so decoding is driven by a descriptor table keyed on
//! the command name rather than by per-method logic.

use crate::error::ClientError;
use linekv_protocol::{STATUS_NOT_FOUND, STATUS_OK};
use std::collections::HashMap;

/// Typed result of a completed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Bool(bool),
    Int(i64),
    List(Vec<String>),
    Map(HashMap<String, String>),
}

impl Reply {
    pub fn into_bool(self) -> Result<bool, ClientError> {
        match self {
            Reply::Bool(v) => Ok(v),
            other => Err(other.mismatch()),
        }
    }

    pub fn into_int(self) -> Result<i64, ClientError> {
        match self {
            Reply::Int(v) => Ok(v),
            other => Err(other.mismatch()),
        }
    }

    pub fn into_list(self) -> Result<Vec<String>, ClientError> {
        match self {
            Reply::List(v) => Ok(v),
            other => Err(other.mismatch()),
        }
    }

    pub fn into_map(self) -> Result<HashMap<String, String>, ClientError> {
        match self {
            Reply::Map(v) => Ok(v),
            other => Err(other.mismatch()),
        }
    }

    /// First payload part of a list-shaped reply.
    pub fn into_string(self) -> Result<String, ClientError> {
        match self {
            Reply::List(v) if !v.is_empty() => Ok(v.into_iter().next().unwrap_or_default()),
            other => Err(other.mismatch()),
        }
    }

    fn mismatch(self) -> ClientError {
        ClientError::UnexpectedResponse(vec![format!("{self:?}")])
    }
}

// Payload shape of a successful response, per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// Success alone carries the answer.
    Ack,
    /// Second part is a `"1"`/`"0"` flag.
    Flag,
    /// Second part is a decimal count.
    Count,
    /// Payload tail is key/value pairs.
    Pairs,
    /// Payload tail is an ordered list.
    List,
}

fn shape_of(cmd: &str) -> Shape {
    match cmd {
        "set" | "del" => Shape::Ack,
        "expire" | "setnx" | "auth" | "exists" | "hexists" => Shape::Flag,
        "hsize" => Shape::Count,
        "hgetall" | "hscan" | "hrscan" | "multi_hget" | "scan" | "rscan" => Shape::Pairs,
        _ => Shape::List,
    }
}

/// Decodes a response frame for `cmd` into a typed reply.
pub fn decode(cmd: &str, parts: Vec<String>) -> Result<Reply, ClientError> {
    match parts.first().map(String::as_str) {
        Some(STATUS_OK) => decode_ok(cmd, parts),
        Some(STATUS_NOT_FOUND) if parts.len() == 1 => Err(ClientError::NotFound),
        _ => Err(ClientError::UnexpectedResponse(parts)),
    }
}

fn decode_ok(cmd: &str, parts: Vec<String>) -> Result<Reply, ClientError> {
    let tail = &parts[1..];
    match shape_of(cmd) {
        Shape::Ack => Ok(Reply::Bool(true)),
        Shape::Flag => Ok(Reply::Bool(tail.first().map(String::as_str) == Some("1"))),
        Shape::Count => match tail.first().and_then(|t| t.parse::<i64>().ok()) {
            Some(v) => Ok(Reply::Int(v)),
            None => Err(ClientError::UnexpectedResponse(parts.clone())),
        },
        Shape::Pairs => {
            let mut map = HashMap::with_capacity(tail.len() / 2);
            for pair in tail.chunks_exact(2) {
                map.insert(pair[0].clone(), pair[1].clone());
            }
            Ok(Reply::Map(map))
        }
        Shape::List => Ok(Reply::List(tail.to_vec())),
    }
}

/// Whether a failed response reports a broken server-side connection,
/// which calls for a redial rather than just surfacing the error.
pub(crate) fn reports_connection_fault(parts: &[String]) -> bool {
    parts.len() == 2 && parts[1].contains("connection")
}
