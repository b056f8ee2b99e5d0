//! Self-describing object codec (spec §4.B).
//!
//! Encodes a dynamic value drawn from
//! `{null, bool, integer, float, string, bytes, list, map, Message}` into a
//! byte buffer that carries its own shape, so `decode(encode(v)) == v`
//! without any external schema. Every variant starts with a one-byte type
//! tag; variable-length variants follow it with a 4-byte big-endian length
//! prefix.
//!
//! This is the payload format framed by [`crate::codec::frame`]. Request
//! and response payloads on both the client protocol (§6) and the peer RPC
//! surface (§4.E) are [`Value`]s; the dispatcher and sync server convert
//! them to/from concrete Rust shapes via the `TryFrom`/`From` impls below
//! rather than matching on `Value` directly.

use crate::types::{Message, MessageId, Status};
use std::collections::HashMap;
use thiserror::Error;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;
const TAG_MESSAGE: u8 = 8;

/// A dynamic value that can appear in a request or response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Order is not significant (spec §4.B: "preserving map key order
    /// irrelevance"); kept as a `Vec` of pairs rather than a `HashMap` so
    /// encode/decode never needs a `Hash` bound and round-trips are exact
    /// even with duplicate-looking keys from a misbehaving peer.
    Map(Vec<(String, Value)>),
    Message(Message),
}

/// Errors that can occur while encoding or decoding a [`Value`].
#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("unexpected end of payload while decoding")]
    UnexpectedEnd,

    #[error("unknown type tag: {0}")]
    UnknownTag(u8),

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("invalid status string: {0}")]
    InvalidStatus(String),

    #[error("trailing bytes after decoding top-level value")]
    TrailingBytes,

    #[error("expected {expected}, found a different shape")]
    WrongShape { expected: &'static str },
}

/// Encodes a value into a freshly-allocated buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// Decodes a single top-level value from a payload buffer. Returns an error
/// if the buffer contains trailing bytes after the value, or not enough
/// bytes for the value it claims to be.
pub fn decode(bytes: &[u8]) -> Result<Value, ValueError> {
    let (value, consumed) = read_value(bytes)?;
    if consumed != bytes.len() {
        return Err(ValueError::TrailingBytes);
    }
    Ok(value)
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_len_prefixed(out, s.as_bytes());
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(if *b { 1 } else { 0 });
        }
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_string(out, s);
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            write_len_prefixed(out, b);
        }
        Value::List(items) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                write_value(out, item);
            }
        }
        Value::Map(entries) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
            for (key, val) in entries {
                write_string(out, key);
                write_value(out, val);
            }
        }
        Value::Message(msg) => {
            out.push(TAG_MESSAGE);
            write_string(out, msg.id.as_str());
            write_string(out, &msg.sender);
            write_string(out, &msg.recipient);
            write_string(out, &msg.content);
            out.extend_from_slice(&msg.timestamp.to_bits().to_be_bytes());
            write_string(out, msg.status.as_str());
        }
    }
}

/// Reads a single value starting at the front of `bytes`, returning the
/// value and the number of bytes it consumed.
fn read_value(bytes: &[u8]) -> Result<(Value, usize), ValueError> {
    let tag = *bytes.first().ok_or(ValueError::UnexpectedEnd)?;
    let rest = &bytes[1..];
    match tag {
        TAG_NULL => Ok((Value::Null, 1)),
        TAG_BOOL => {
            let b = *rest.first().ok_or(ValueError::UnexpectedEnd)?;
            Ok((Value::Bool(b != 0), 2))
        }
        TAG_INT => {
            let n = read_i64(rest)?;
            Ok((Value::Int(n), 1 + 8))
        }
        TAG_FLOAT => {
            let n = read_u64(rest)?;
            Ok((Value::Float(f64::from_bits(n)), 1 + 8))
        }
        TAG_STRING => {
            let (s, len) = read_string(rest)?;
            Ok((Value::String(s), 1 + len))
        }
        TAG_BYTES => {
            let (b, len) = read_bytes(rest)?;
            Ok((Value::Bytes(b), 1 + len))
        }
        TAG_LIST => {
            let count = read_u32(rest)? as usize;
            let mut offset = 4;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let (item, consumed) = read_value(&rest[offset..])?;
                items.push(item);
                offset += consumed;
            }
            Ok((Value::List(items), 1 + offset))
        }
        TAG_MAP => {
            let count = read_u32(rest)? as usize;
            let mut offset = 4;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let (key, key_len) = read_string(&rest[offset..])?;
                offset += key_len;
                let (val, val_len) = read_value(&rest[offset..])?;
                offset += val_len;
                entries.push((key, val));
            }
            Ok((Value::Map(entries), 1 + offset))
        }
        TAG_MESSAGE => {
            let mut offset = 0;
            let (id, len) = read_string(&rest[offset..])?;
            offset += len;
            let (sender, len) = read_string(&rest[offset..])?;
            offset += len;
            let (recipient, len) = read_string(&rest[offset..])?;
            offset += len;
            let (content, len) = read_string(&rest[offset..])?;
            offset += len;
            let ts_bits = read_u64(&rest[offset..])?;
            offset += 8;
            let (status_str, len) = read_string(&rest[offset..])?;
            offset += len;
            let status = Status::from_str_loose(&status_str)
                .ok_or(ValueError::InvalidStatus(status_str))?;
            let msg = Message {
                id: MessageId::new(id),
                sender,
                recipient,
                content,
                timestamp: f64::from_bits(ts_bits),
                status,
            };
            Ok((Value::Message(msg), 1 + offset))
        }
        other => Err(ValueError::UnknownTag(other)),
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32, ValueError> {
    let arr: [u8; 4] = bytes.get(0..4).ok_or(ValueError::UnexpectedEnd)?.try_into().unwrap();
    Ok(u32::from_be_bytes(arr))
}

fn read_u64(bytes: &[u8]) -> Result<u64, ValueError> {
    let arr: [u8; 8] = bytes.get(0..8).ok_or(ValueError::UnexpectedEnd)?.try_into().unwrap();
    Ok(u64::from_be_bytes(arr))
}

fn read_i64(bytes: &[u8]) -> Result<i64, ValueError> {
    let arr: [u8; 8] = bytes.get(0..8).ok_or(ValueError::UnexpectedEnd)?.try_into().unwrap();
    Ok(i64::from_be_bytes(arr))
}

/// Reads a length-prefixed byte string, returning the bytes and the total
/// number of bytes consumed (4-byte prefix + payload).
fn read_bytes(bytes: &[u8]) -> Result<(Vec<u8>, usize), ValueError> {
    let len = read_u32(bytes)? as usize;
    let payload = bytes.get(4..4 + len).ok_or(ValueError::UnexpectedEnd)?;
    Ok((payload.to_vec(), 4 + len))
}

/// Reads a length-prefixed UTF-8 string, returning the string and the total
/// number of bytes consumed.
fn read_string(bytes: &[u8]) -> Result<(String, usize), ValueError> {
    let (raw, consumed) = read_bytes(bytes)?;
    let s = String::from_utf8(raw).map_err(|_| ValueError::InvalidUtf8)?;
    Ok((s, consumed))
}

// ---------------------------------------------------------------------------
// Typed accessors — concrete shapes the dispatcher and sync surface need.
// ---------------------------------------------------------------------------

impl Value {
    pub fn as_string(&self) -> Result<&str, ValueError> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(ValueError::WrongShape { expected: "string" }),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], ValueError> {
        match self {
            Value::List(items) => Ok(items),
            _ => Err(ValueError::WrongShape { expected: "list" }),
        }
    }

    pub fn as_message(&self) -> Result<&Message, ValueError> {
        match self {
            Value::Message(m) => Ok(m),
            _ => Err(ValueError::WrongShape { expected: "message" }),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Message> for Value {
    fn from(m: Message) -> Self {
        Value::Message(m)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::String).collect())
    }
}

impl From<Vec<Message>> for Value {
    fn from(items: Vec<Message>) -> Self {
        Value::List(items.into_iter().map(Value::Message).collect())
    }
}

impl From<HashMap<String, i64>> for Value {
    fn from(map: HashMap<String, i64>) -> Self {
        Value::Map(map.into_iter().map(|(k, v)| (k, Value::Int(v))).collect())
    }
}

impl TryFrom<&Value> for Vec<String> {
    type Error = ValueError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        value
            .as_list()?
            .iter()
            .map(|v| v.as_string().map(str::to_string))
            .collect()
    }
}

impl TryFrom<&Value> for Vec<Message> {
    type Error = ValueError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        value
            .as_list()?
            .iter()
            .map(|v| v.as_message().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let bytes = encode(&v);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn null_roundtrip() {
        roundtrip(Value::Null);
    }

    #[test]
    fn bool_roundtrip() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
    }

    #[test]
    fn int_roundtrip() {
        roundtrip(Value::Int(-42));
        roundtrip(Value::Int(i64::MAX));
    }

    #[test]
    fn float_roundtrip() {
        roundtrip(Value::Float(1700000000.5));
    }

    #[test]
    fn string_roundtrip_utf8() {
        roundtrip(Value::String("héllo wörld".to_string()));
    }

    #[test]
    fn bytes_roundtrip() {
        roundtrip(Value::Bytes(vec![0, 1, 2, 255]));
    }

    #[test]
    fn list_roundtrip() {
        roundtrip(Value::List(vec![Value::Int(1), Value::String("a".into()), Value::Null]));
    }

    #[test]
    fn map_roundtrip() {
        roundtrip(Value::Map(vec![
            ("alice".to_string(), Value::Int(2)),
            ("bob".to_string(), Value::Int(0)),
        ]));
    }

    #[test]
    fn message_roundtrip() {
        let msg = Message::new("alice", "bob", "hi", 1700000000.0, Status::Unread);
        roundtrip(Value::Message(msg));
    }

    #[test]
    fn unknown_tag_fails() {
        let bytes = vec![255u8];
        assert_eq!(decode(&bytes), Err(ValueError::UnknownTag(255)));
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut bytes = encode(&Value::Null);
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(ValueError::TrailingBytes));
    }

    #[test]
    fn truncated_payload_fails() {
        let bytes = encode(&Value::String("hello".to_string()));
        let truncated = &bytes[..bytes.len() - 2];
        assert!(decode(truncated).is_err());
    }

    #[test]
    fn vec_string_conversion() {
        let v: Value = vec!["a".to_string(), "b".to_string()].into();
        let back: Vec<String> = (&v).try_into().unwrap();
        assert_eq!(back, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn vec_message_conversion() {
        let msgs = vec![Message::new("a", "b", "hi", 1.0, Status::Unread)];
        let v: Value = msgs.clone().into();
        let back: Vec<Message> = (&v).try_into().unwrap();
        assert_eq!(back, msgs);
    }
}
