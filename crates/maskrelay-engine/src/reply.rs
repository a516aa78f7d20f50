use anyhow::{Context, Result};
use rmpv::Value as PackValue;

/// Mapping key as the wire decoder materialized it. Servers disagree on whether
/// map keys arrive as text or as raw byte strings, so both are kept distinct and
/// lookups consult either form.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyKey {
    Text(String),
    Bytes(Vec<u8>),
    Other(RawReply),
}

impl ReplyKey {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Text(text) => text == name,
            Self::Bytes(bytes) => bytes.as_slice() == name.as_bytes(),
            Self::Other(_) => false,
        }
    }
}

/// Dynamically shaped reply tree decoded from a streaming-variant frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    Mapping(Vec<(ReplyKey, RawReply)>),
    Sequence(Vec<RawReply>),
    Text(String),
    Bytes(Vec<u8>),
    Integer(i128),
    Float(f64),
    Bool(bool),
    Nil,
}

impl RawReply {
    /// Values stored under `name`: every text-form key first, then every
    /// byte-form key, each in wire order.
    pub fn fields<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a RawReply> + 'a {
        let entries: &[(ReplyKey, RawReply)] = match self {
            Self::Mapping(entries) => entries.as_slice(),
            _ => &[],
        };
        let text = entries
            .iter()
            .filter(move |(key, _)| matches!(key, ReplyKey::Text(_)) && key.matches(name));
        let bytes = entries
            .iter()
            .filter(move |(key, _)| matches!(key, ReplyKey::Bytes(_)) && key.matches(name));
        text.chain(bytes).map(|(_, value)| value)
    }

    pub fn get(&self, name: &str) -> Option<&RawReply> {
        let Self::Mapping(entries) = self else {
            return None;
        };
        let find = |bytes_form: bool| {
            entries
                .iter()
                .find(|(key, _)| matches!(key, ReplyKey::Bytes(_)) == bytes_form && key.matches(name))
                .map(|(_, value)| value)
        };
        find(false).or_else(|| find(true))
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Nil and zero-length containers carry no mask.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Nil => true,
            Self::Mapping(entries) => entries.is_empty(),
            Self::Sequence(items) => items.is_empty(),
            Self::Text(text) => text.is_empty(),
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Integer(_) | Self::Float(_) | Self::Bool(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes.as_slice()),
            Self::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Integer(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            other => !other.is_empty(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Mapping(_) => "mapping",
            Self::Sequence(_) => "sequence",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Nil => "nil",
        }
    }
}

impl From<PackValue> for RawReply {
    fn from(value: PackValue) -> Self {
        match value {
            PackValue::Nil => Self::Nil,
            PackValue::Boolean(flag) => Self::Bool(flag),
            PackValue::Integer(number) => number
                .as_i64()
                .map(i128::from)
                .or_else(|| number.as_u64().map(i128::from))
                .map(Self::Integer)
                .unwrap_or(Self::Nil),
            PackValue::F32(number) => Self::Float(f64::from(number)),
            PackValue::F64(number) => Self::Float(number),
            PackValue::String(text) => match text.into_str() {
                Some(text) => Self::Text(text),
                None => Self::Nil,
            },
            PackValue::Binary(bytes) => Self::Bytes(bytes),
            PackValue::Array(items) => Self::Sequence(items.into_iter().map(Self::from).collect()),
            PackValue::Map(entries) => Self::Mapping(
                entries
                    .into_iter()
                    .map(|(key, value)| (ReplyKey::from(key), Self::from(value)))
                    .collect(),
            ),
            PackValue::Ext(_, bytes) => Self::Bytes(bytes),
        }
    }
}

impl From<PackValue> for ReplyKey {
    fn from(value: PackValue) -> Self {
        match value {
            PackValue::String(text) => match text.into_str() {
                Some(text) => Self::Text(text),
                None => Self::Other(RawReply::Nil),
            },
            PackValue::Binary(bytes) => Self::Bytes(bytes),
            other => Self::Other(RawReply::from(other)),
        }
    }
}

impl From<serde_json::Value> for RawReply {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as JsonValue;
        match value {
            JsonValue::Null => Self::Nil,
            JsonValue::Bool(flag) => Self::Bool(flag),
            JsonValue::Number(number) => number
                .as_i64()
                .map(|value| Self::Integer(i128::from(value)))
                .or_else(|| number.as_u64().map(|value| Self::Integer(i128::from(value))))
                .or_else(|| number.as_f64().map(Self::Float))
                .unwrap_or(Self::Nil),
            JsonValue::String(text) => Self::Text(text),
            JsonValue::Array(items) => Self::Sequence(items.into_iter().map(Self::from).collect()),
            JsonValue::Object(entries) => Self::Mapping(
                entries
                    .into_iter()
                    .map(|(key, value)| (ReplyKey::Text(key), Self::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Decode one MessagePack frame. Trailing bytes after the first value are ignored.
pub fn decode_reply(frame: &[u8]) -> Result<RawReply> {
    let mut cursor = frame;
    let value = rmpv::decode::read_value(&mut cursor).context("reply is not valid MessagePack")?;
    Ok(RawReply::from(value))
}

/// Some servers answer with JSON text frames instead of MessagePack.
pub fn decode_json_reply(frame: &str) -> Result<RawReply> {
    let value: serde_json::Value =
        serde_json::from_str(frame).context("text reply is not valid JSON")?;
    Ok(RawReply::from(value))
}
