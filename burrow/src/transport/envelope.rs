//! Envelope framing for transfer links.
//!
//! Wire format: `[magic][base64(key):base64(json(value));]*[stream!:<raw bytes>]`

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::ConnectionId;

/// Header shared by every agent and gateway unless configured otherwise.
pub const DEFAULT_MAGIC: [u8; 4] = [0xc4, 0x11, 0x75, 0x03];

const STREAM_MARKER: &[u8] = b"stream!:";
const KEY_END: u8 = b':';
const VALUE_END: u8 = b';';
const STREAM_START: u8 = b'!';

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Buffer does not start with the protocol header")]
    NotThisProtocol,
    #[error("Invalid base64 segment")]
    Base64(#[from] base64::DecodeError),
    #[error("Field name is not valid UTF-8")]
    FieldName(#[from] std::string::FromUtf8Error),
    #[error("Failed to (de)serialize envelope field")]
    Json(#[from] serde_json::Error),
    #[error("Envelope did not serialize into a field map")]
    NotAMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Connect,
    Message,
    Ping,
    Pong,
    Close,
    Heartbeat,
    Assign,
}

/// A request header value. Repeated headers travel as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValue::Single(value) => std::slice::from_ref(value),
            HeaderValue::Multiple(values) => values,
        };
        values.iter().map(String::as_str)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Set on `message` envelopes whose payload came from a text frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<bool>,
    /// Raw trailing payload, never part of the key/value section.
    #[serde(skip)]
    pub stream: Option<Bytes>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            id: None,
            code: None,
            reason: None,
            path: None,
            headers: None,
            ts: None,
            status: None,
            text: None,
            stream: None,
        }
    }

    pub fn connect(id: ConnectionId, path: impl Into<String>, headers: Headers) -> Self {
        Self {
            id: Some(id),
            path: Some(path.into()),
            headers: Some(headers),
            ..Self::new(EnvelopeKind::Connect)
        }
    }

    pub fn message(id: ConnectionId, data: Bytes, text: bool) -> Self {
        Self {
            id: Some(id),
            text: text.then_some(true),
            stream: Some(data),
            ..Self::new(EnvelopeKind::Message)
        }
    }

    pub fn ping(id: ConnectionId, data: Bytes) -> Self {
        Self {
            id: Some(id),
            stream: Some(data),
            ..Self::new(EnvelopeKind::Ping)
        }
    }

    pub fn pong(id: ConnectionId, data: Bytes) -> Self {
        Self {
            id: Some(id),
            stream: Some(data),
            ..Self::new(EnvelopeKind::Pong)
        }
    }

    pub fn close(id: ConnectionId, code: u16, reason: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            code: Some(code),
            reason: Some(reason.into()),
            ..Self::new(EnvelopeKind::Close)
        }
    }

    pub fn heartbeat(ts: u64) -> Self {
        Self {
            ts: Some(ts),
            ..Self::new(EnvelopeKind::Heartbeat)
        }
    }

    /// Payload bytes, empty when the envelope carried none.
    pub fn payload(&self) -> Bytes {
        self.stream.clone().unwrap_or_default()
    }
}

/// Encoder/decoder bound to one deployment's magic header.
#[derive(Debug, Clone)]
pub struct Codec {
    magic: Bytes,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAGIC.to_vec())
    }
}

impl Codec {
    pub fn new(magic: impl Into<Bytes>) -> Self {
        Self {
            magic: magic.into(),
        }
    }

    /// Whether `buf` carries this protocol's header.
    pub fn is_this(&self, buf: &[u8]) -> bool {
        buf.starts_with(&self.magic)
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, EnvelopeError> {
        let serde_json::Value::Object(fields) = serde_json::to_value(envelope)? else {
            return Err(EnvelopeError::NotAMap);
        };

        let stream_len = envelope.stream.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(self.magic.len() + 64 * fields.len() + stream_len);
        buf.put_slice(&self.magic);

        for (key, value) in &fields {
            buf.put_slice(STANDARD.encode(key).as_bytes());
            buf.put_u8(KEY_END);
            buf.put_slice(STANDARD.encode(serde_json::to_vec(value)?).as_bytes());
            buf.put_u8(VALUE_END);
        }

        if let Some(stream) = &envelope.stream {
            buf.put_slice(STREAM_MARKER);
            buf.put_slice(stream);
        }

        Ok(buf.freeze())
    }

    pub fn decode(&self, buf: &Bytes) -> Result<Envelope, EnvelopeError> {
        if !self.is_this(buf) {
            return Err(EnvelopeError::NotThisProtocol);
        }
        let offset = self.magic.len();
        let body = &buf[offset..];

        let mut fields = serde_json::Map::new();
        let mut stream = None;
        let mut start = 0;
        let mut key = String::new();

        for (pos, byte) in body.iter().enumerate() {
            match *byte {
                // `!` only ever appears in the `stream!:` marker.
                STREAM_START => {
                    let from = (offset + pos + 2).min(buf.len());
                    stream = Some(buf.slice(from..));
                    break;
                }
                KEY_END => {
                    key = String::from_utf8(STANDARD.decode(&body[start..pos])?)?;
                    start = pos + 1;
                }
                VALUE_END => {
                    let value = serde_json::from_slice(&STANDARD.decode(&body[start..pos])?)?;
                    fields.insert(std::mem::take(&mut key), value);
                    start = pos + 1;
                }
                _ => {}
            }
        }

        let mut envelope: Envelope = serde_json::from_value(serde_json::Value::Object(fields))?;
        envelope.stream = stream;
        Ok(envelope)
    }
}
