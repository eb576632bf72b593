//! Header extraction chain.
//!
//! Each reply attribute (correlation id, reply-to, destination, total reply
//! count, reply index, error message) is read through a fixed, ordered list of
//! header sources. The first source yielding a usable value wins:
//!
//! 1. transport-native headers (Kafka, AMQP, MQTT 5 names)
//! 2. the standard correlation headers written by this crate
//! 3. generic HTTP-style `X-*` headers, matched case-insensitively
//!
//! Extraction never fails: missing, blank, or unparseable values fall through
//! to the next source and finally to `None`.

use crate::envelope::{Envelope, HeaderValue};
use std::borrow::Cow;
use std::fmt;

pub const CORRELATION_ID: &str = "correlationId";
pub const REPLY_TO: &str = "replyTo";
pub const DESTINATION: &str = "destination";
pub const TOTAL_REPLIES: &str = "totalReplies";
pub const REPLY_INDEX: &str = "replyIndex";
pub const ERROR_MESSAGE: &str = "errorMessage";
pub const REPLY_GROUP: &str = "replyGroup";

const UNBOUNDED_SENTINEL: &str = "unknown";

/// Where a header value is read from. Order inside a chain is the precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSource {
    Native(&'static str),
    Standard(&'static str),
    Http(&'static str),
}

impl HeaderSource {
    pub fn name(self) -> &'static str {
        match self {
            Self::Native(name) | Self::Standard(name) | Self::Http(name) => name,
        }
    }

    fn lookup(self, envelope: &Envelope) -> Option<&HeaderValue> {
        match self {
            Self::Native(name) | Self::Standard(name) => envelope.header(name),
            Self::Http(name) => envelope.header_ignore_case(name),
        }
    }

    fn read(self, envelope: &Envelope) -> Option<Cow<'_, str>> {
        let text = self.lookup(envelope)?.as_text()?;
        if text.trim().is_empty() {
            return None;
        }
        Some(text)
    }
}

pub const CORRELATION_ID_CHAIN: &[HeaderSource] = &[
    HeaderSource::Native("kafka_correlationId"),
    HeaderSource::Native("amqp_correlationId"),
    HeaderSource::Native("mqtt_correlationData"),
    HeaderSource::Standard(CORRELATION_ID),
    HeaderSource::Http("X-Correlation-Id"),
];

pub const REPLY_TO_CHAIN: &[HeaderSource] = &[
    HeaderSource::Native("kafka_replyTopic"),
    HeaderSource::Native("amqp_replyTo"),
    HeaderSource::Native("mqtt_responseTopic"),
    HeaderSource::Standard(REPLY_TO),
    HeaderSource::Http("X-Reply-To"),
];

pub const DESTINATION_CHAIN: &[HeaderSource] = &[
    HeaderSource::Native("kafka_topic"),
    HeaderSource::Native("amqp_receivedRoutingKey"),
    HeaderSource::Native("mqtt_receivedTopic"),
    HeaderSource::Standard(DESTINATION),
    HeaderSource::Http("X-Destination"),
];

pub const TOTAL_REPLIES_CHAIN: &[HeaderSource] = &[
    HeaderSource::Standard(TOTAL_REPLIES),
    HeaderSource::Http("X-Total-Replies"),
];

pub const REPLY_INDEX_CHAIN: &[HeaderSource] = &[
    HeaderSource::Standard(REPLY_INDEX),
    HeaderSource::Http("X-Reply-Index"),
];

pub const ERROR_MESSAGE_CHAIN: &[HeaderSource] = &[
    HeaderSource::Standard(ERROR_MESSAGE),
    HeaderSource::Http("X-Error-Message"),
];

const REPLY_GROUP_CHAIN: &[HeaderSource] = &[
    HeaderSource::Standard(REPLY_GROUP),
    HeaderSource::Http("X-Reply-Group"),
];

fn first_match<T>(
    chain: &[HeaderSource],
    envelope: &Envelope,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    chain
        .iter()
        .find_map(|source| source.read(envelope).and_then(|text| parse(text.trim())))
}

fn owned(text: &str) -> Option<String> {
    Some(text.to_string())
}

pub fn correlation_id(envelope: &Envelope) -> Option<String> {
    first_match(CORRELATION_ID_CHAIN, envelope, owned)
}

pub fn reply_to(envelope: &Envelope) -> Option<String> {
    first_match(REPLY_TO_CHAIN, envelope, owned)
}

pub fn destination(envelope: &Envelope) -> Option<String> {
    first_match(DESTINATION_CHAIN, envelope, owned)
}

pub fn total_replies(envelope: &Envelope) -> Option<TotalReplies> {
    first_match(TOTAL_REPLIES_CHAIN, envelope, TotalReplies::parse)
}

pub fn reply_index(envelope: &Envelope) -> Option<ReplyIndex> {
    first_match(REPLY_INDEX_CHAIN, envelope, ReplyIndex::parse)
}

pub fn error_message(envelope: &Envelope) -> Option<String> {
    first_match(ERROR_MESSAGE_CHAIN, envelope, owned)
}

/// Whether the envelope carries a packed group of replies.
pub fn is_group(envelope: &Envelope) -> bool {
    first_match(REPLY_GROUP_CHAIN, envelope, |text| text.parse::<bool>().ok()).unwrap_or(false)
}

/// Remove the group flag from every source [`is_group`] reads.
pub fn without_group_flag(envelope: Envelope) -> Envelope {
    REPLY_GROUP_CHAIN
        .iter()
        .fold(envelope, |envelope, source| match *source {
            HeaderSource::Native(name) | HeaderSource::Standard(name) => {
                envelope.without_header(name)
            }
            HeaderSource::Http(name) => envelope.without_header_ignore_case(name),
        })
}

/// Declared number of replies for a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TotalReplies {
    /// Known count; `Exactly(0)` is the terminal/empty marker.
    Exactly(usize),
    /// Size unknown up front; completion needs an explicit terminal marker.
    Unbounded,
}

impl TotalReplies {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(UNBOUNDED_SENTINEL) {
            return Some(Self::Unbounded);
        }
        match raw.parse::<i64>().ok()? {
            -1 => Some(Self::Unbounded),
            n => usize::try_from(n).ok().map(Self::Exactly),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Exactly(0)
    }

    pub fn to_header(self) -> HeaderValue {
        match self {
            Self::Exactly(n) => HeaderValue::from(n),
            Self::Unbounded => HeaderValue::from(UNBOUNDED_SENTINEL),
        }
    }
}

impl fmt::Display for TotalReplies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exactly(n) => write!(f, "{n}"),
            Self::Unbounded => f.write_str(UNBOUNDED_SENTINEL),
        }
    }
}

/// Position of a reply (or a packed group of replies) in a multi-reply exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyIndex {
    Single(u64),
    /// Inclusive range covered by a packed group.
    Range { start: u64, end: u64 },
}

impl ReplyIndex {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.split_once('-') {
            None => raw.parse().ok().map(Self::Single),
            Some((start, end)) => {
                let start: u64 = start.trim().parse().ok()?;
                let end: u64 = end.trim().parse().ok()?;
                (start <= end).then_some(Self::Range { start, end })
            }
        }
    }

    /// Dedup key: ranges are keyed by their first index.
    pub fn start(self) -> u64 {
        match self {
            Self::Single(index) => index,
            Self::Range { start, .. } => start,
        }
    }

    pub fn span(self) -> u64 {
        match self {
            Self::Single(_) => 1,
            Self::Range { start, end } => (end - start).saturating_add(1),
        }
    }
}

impl fmt::Display for ReplyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(index) => write!(f, "{index}"),
            Self::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

/// Correlation view of an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyInfo {
    pub correlation_id: Option<String>,
    pub total_replies: Option<TotalReplies>,
    pub reply_index: Option<ReplyIndex>,
    pub error_message: Option<String>,
}

impl ReplyInfo {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            correlation_id: correlation_id(envelope),
            total_replies: total_replies(envelope),
            reply_index: reply_index(envelope),
            error_message: error_message(envelope),
        }
    }
}
