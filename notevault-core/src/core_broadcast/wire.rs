/*
    wire.rs - Type-tagged binary values and the broadcast reply envelope

    Every value is one record:

        [tag: 1 byte][length: 4 bytes, big-endian][payload: length bytes]

    Tags:
        0x01 String   UTF-8 bytes
        0x02 Integer  i64, 8 bytes big-endian
        0x03 Object   concatenated (String key record, value record) pairs
        0x04 Binary   raw bytes

    The reply envelope is an Object:

        { "sender": String, "kind": String, "payload": Object<recipient, entry> }

    where an entry is Binary (the recipient's reply) or an Object
    { "stage": String, "message": String } describing its failure.
*/

use super::errors::{DecodeError, EncodeError};
use super::node::NodeId;
use std::collections::BTreeMap;
use std::fmt;

pub const TAG_STRING: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OBJECT: u8 = 0x03;
pub const TAG_BINARY: u8 = 0x04;

/// Tag plus length prefix
pub const HEADER_LEN: usize = 5;

/// Deepest object nesting `decode` accepts
pub const MAX_DEPTH: usize = 32;

/// A wire value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Integer(i64),
    Object(Vec<(String, Value)>),
    Binary(Vec<u8>),
}

impl Value {
    /// Size of the encoded record
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Value::String(s) => s.len(),
                Value::Integer(_) => 8,
                Value::Binary(b) => b.len(),
                Value::Object(fields) => fields
                    .iter()
                    .map(|(k, v)| HEADER_LEN + k.len() + v.encoded_len())
                    .sum(),
            }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Append the encoded record to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            Value::String(s) => put_record(out, TAG_STRING, s.as_bytes()),
            Value::Integer(n) => put_record(out, TAG_INTEGER, &n.to_be_bytes()),
            Value::Binary(b) => put_record(out, TAG_BINARY, b),
            Value::Object(fields) => {
                let start = out.len();
                out.push(TAG_OBJECT);
                out.extend_from_slice(&[0u8; 4]);
                for (key, value) in fields {
                    put_record(out, TAG_STRING, key.as_bytes())?;
                    value.encode_into(out)?;
                }
                let len = out.len() - start - HEADER_LEN;
                let len = u32::try_from(len).map_err(|_| EncodeError::TooLong(len))?;
                out[start + 1..start + HEADER_LEN].copy_from_slice(&len.to_be_bytes());
                Ok(())
            }
        }
    }

    /// Decode exactly one record spanning all of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
        let mut reader = Reader::new(bytes);
        let value = reader.value(0)?;
        if reader.remaining() > 0 {
            return Err(DecodeError::TrailingBytes(reader.remaining()));
        }
        Ok(value)
    }

    /// Field `key` of an object; `None` for other kinds
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

fn put_record(out: &mut Vec<u8>, tag: u8, payload: &[u8]) -> Result<(), EncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| EncodeError::TooLong(payload.len()))?;
    out.push(tag);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Bounds-checked cursor; offsets in errors are absolute
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader {
            buf,
            pos: 0,
            end: buf.len(),
        }
    }

    fn remaining(&self) -> usize {
        self.end - self.pos
    }

    /// Next record header and payload
    fn record(&mut self) -> Result<(u8, usize, &'a [u8]), DecodeError> {
        let offset = self.pos;
        if self.remaining() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                offset,
                needed: HEADER_LEN,
            });
        }
        let tag = self.buf[offset];
        let len = u32::from_be_bytes([
            self.buf[offset + 1],
            self.buf[offset + 2],
            self.buf[offset + 3],
            self.buf[offset + 4],
        ]) as usize;

        let start = offset + HEADER_LEN;
        if self.end - start < len {
            return Err(DecodeError::Truncated {
                offset: start,
                needed: len,
            });
        }
        self.pos = start + len;
        Ok((tag, offset, &self.buf[start..start + len]))
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let (tag, offset, payload) = self.record()?;
        match tag {
            TAG_STRING => string(payload, offset).map(Value::String),
            TAG_INTEGER => {
                let bytes: [u8; 8] = payload.try_into().map_err(|_| DecodeError::InvalidInteger {
                    offset,
                    len: payload.len(),
                })?;
                Ok(Value::Integer(i64::from_be_bytes(bytes)))
            }
            TAG_BINARY => Ok(Value::Binary(payload.to_vec())),
            TAG_OBJECT => {
                if depth >= MAX_DEPTH {
                    return Err(DecodeError::TooDeep(MAX_DEPTH));
                }
                let mut inner = Reader {
                    buf: self.buf,
                    pos: offset + HEADER_LEN,
                    end: offset + HEADER_LEN + payload.len(),
                };
                let mut fields = Vec::new();
                while inner.remaining() > 0 {
                    let (key_tag, key_offset, key) = inner.record()?;
                    if key_tag != TAG_STRING {
                        return Err(DecodeError::InvalidKey {
                            offset: key_offset,
                            tag: key_tag,
                        });
                    }
                    let key = string(key, key_offset)?;
                    let value = inner.value(depth + 1)?;
                    fields.push((key, value));
                }
                Ok(Value::Object(fields))
            }
            other => Err(DecodeError::UnknownTag { tag: other, offset }),
        }
    }
}

fn string(payload: &[u8], offset: usize) -> Result<String, DecodeError> {
    String::from_utf8(payload.to_vec()).map_err(|_| DecodeError::InvalidUtf8(offset))
}

/// Envelope kind marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    BroadcastResult,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::BroadcastResult => "broadcast_result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "broadcast_result" => Some(MessageKind::BroadcastResult),
            _ => None,
        }
    }
}

/// Where a recipient's delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    /// Recipient is not registered
    Resolve,
    /// The handle returned an error or panicked
    Invoke,
    /// Writing the message to the recipient failed
    Write,
    /// Reading the reply failed
    Read,
    /// No complete reply before the recipient deadline
    Timeout,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Resolve => "resolve",
            FailureStage::Invoke => "invoke",
            FailureStage::Write => "write",
            FailureStage::Read => "read",
            FailureStage::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resolve" => Some(FailureStage::Resolve),
            "invoke" => Some(FailureStage::Invoke),
            "write" => Some(FailureStage::Write),
            "read" => Some(FailureStage::Read),
            "timeout" => Some(FailureStage::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure recorded for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientError {
    pub stage: FailureStage,
    pub message: String,
}

/// Outcome for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    Reply(Vec<u8>),
    Error(RecipientError),
}

impl ReplyPayload {
    pub fn error(stage: FailureStage, message: impl Into<String>) -> Self {
        ReplyPayload::Error(RecipientError {
            stage,
            message: message.into(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReplyPayload::Error(_))
    }

    /// The recipient error, if delivery failed
    pub fn failure(&self) -> Option<&RecipientError> {
        match self {
            ReplyPayload::Error(err) => Some(err),
            ReplyPayload::Reply(_) => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ReplyPayload::Reply(bytes) => Value::Binary(bytes.clone()),
            ReplyPayload::Error(err) => Value::Object(vec![
                ("stage".to_string(), Value::String(err.stage.as_str().to_string())),
                ("message".to_string(), Value::String(err.message.clone())),
            ]),
        }
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Binary(bytes) => Ok(ReplyPayload::Reply(bytes.clone())),
            Value::Object(_) => {
                let stage = text_field(value, "stage")?;
                let stage = FailureStage::parse(stage).ok_or_else(|| {
                    DecodeError::InvalidEnvelope(format!("unknown failure stage {:?}", stage))
                })?;
                let message = text_field(value, "message")?.to_string();
                Ok(ReplyPayload::Error(RecipientError { stage, message }))
            }
            _ => Err(DecodeError::InvalidEnvelope(
                "entry must be binary or an error object".to_string(),
            )),
        }
    }
}

/// Aggregated reply of one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub sender: String,
    pub kind: MessageKind,
    pub payload: BTreeMap<NodeId, ReplyPayload>,
}

impl ReplyEnvelope {
    pub fn to_value(&self) -> Value {
        let entries = self
            .payload
            .iter()
            .map(|(id, entry)| (id.as_str().to_string(), entry.to_value()))
            .collect();
        Value::Object(vec![
            ("sender".to_string(), Value::String(self.sender.clone())),
            ("kind".to_string(), Value::String(self.kind.as_str().to_string())),
            ("payload".to_string(), Value::Object(entries)),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let sender = text_field(value, "sender")?.to_string();
        let kind = text_field(value, "kind")?;
        let kind = MessageKind::parse(kind)
            .ok_or_else(|| DecodeError::InvalidEnvelope(format!("unknown kind {:?}", kind)))?;

        let entries = match value.get("payload") {
            Some(Value::Object(entries)) => entries,
            _ => {
                return Err(DecodeError::InvalidEnvelope(
                    "payload must be an object".to_string(),
                ))
            }
        };
        let mut payload = BTreeMap::new();
        for (id, entry) in entries {
            let entry = ReplyPayload::from_value(entry)?;
            if payload.insert(NodeId::new(id.clone()), entry).is_some() {
                return Err(DecodeError::InvalidEnvelope(format!(
                    "duplicate recipient {:?}",
                    id
                )));
            }
        }

        Ok(ReplyEnvelope {
            sender,
            kind,
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.to_value().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(&Value::decode(bytes)?)
    }
}

fn text_field<'v>(value: &'v Value, key: &str) -> Result<&'v str, DecodeError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::InvalidEnvelope(format!("missing string field {:?}", key)))
}
