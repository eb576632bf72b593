use crate::error::ReplyError;
use crate::transport::PayloadConverter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// A single metadata value carried next to a payload.
///
/// Transports disagree on header typing (Kafka carries bytes, AMQP carries
/// typed scalars, HTTP carries text), so readers go through [`as_text`] and
/// [`as_i64`] rather than matching on the variant.
///
/// [`as_text`]: HeaderValue::as_text
/// [`as_i64`]: HeaderValue::as_i64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Textual view of the value. Binary values must be valid UTF-8.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Text(value) => Some(Cow::Borrowed(value.as_str())),
            Self::Int(value) => Some(Cow::Owned(value.to_string())),
            Self::Bool(value) => Some(Cow::Owned(value.to_string())),
            Self::Bytes(bytes) => std::str::from_utf8(bytes).ok().map(Cow::Borrowed),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(_) | Self::Bytes(_) => self.as_text()?.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Text(_) | Self::Bytes(_) => self.as_text()?.trim().parse().ok(),
            Self::Int(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for HeaderValue {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or_else(|_| Self::Text(value.to_string()), Self::Int)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Message body: raw bytes, or a typed value not yet serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(Value),
}

impl Payload {
    pub fn empty() -> Self {
        Self::Bytes(Vec::new())
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Bytes(value.into().into_bytes())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Json(value) => value.is_null(),
        }
    }

    /// Raw bytes, when the payload is already in wire form.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Json(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Decode into `T`, going through `converter` when the payload is still bytes.
    pub fn decode<T: DeserializeOwned>(
        &self,
        converter: &dyn PayloadConverter,
    ) -> Result<T, ReplyError> {
        let value = match self {
            Self::Json(value) => value.clone(),
            Self::Bytes(bytes) => converter
                .from_bytes(bytes)
                .map_err(|e| ReplyError::Conversion(e.to_string()))?,
        };
        serde_json::from_value(value).map_err(|e| ReplyError::Conversion(e.to_string()))
    }

    /// Serialize to wire bytes, using `converter` for typed values.
    pub fn into_bytes(self, converter: &dyn PayloadConverter) -> Result<Vec<u8>, ReplyError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Json(value) => converter
                .to_bytes(&value)
                .map_err(|e| ReplyError::Conversion(e.to_string())),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Payload plus metadata, the unit exchanged over the transport.
///
/// Envelopes are immutable once built: every transformation consumes the
/// envelope and hands back a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    payload: Payload,
    #[serde(default)]
    headers: BTreeMap<String, HeaderValue>,
}

impl Envelope {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &BTreeMap<String, HeaderValue> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Header lookup ignoring ASCII case, for HTTP-style names.
    pub fn header_ignore_case(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        for (name, value) in headers {
            self.headers.insert(name.into(), value.into());
        }
        self
    }

    #[must_use]
    pub fn without_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    /// Drop every header whose name matches `name` ignoring ASCII case.
    #[must_use]
    pub fn without_header_ignore_case(mut self, name: &str) -> Self {
        self.headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn into_parts(self) -> (Payload, BTreeMap<String, HeaderValue>) {
        (self.payload, self.headers)
    }
}

impl From<Payload> for Envelope {
    fn from(payload: Payload) -> Self {
        Self::new(payload)
    }
}
