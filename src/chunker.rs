//! Packing many small replies into few transport messages.
//!
//! A packed group travels as one envelope whose payload is a JSON container
//! of base64 entries, flagged with `replyGroup=true` and tagged with the
//! inclusive index range it covers (`replyIndex="0-41"`). The receiving side
//! unpacks it back into one envelope per entry.

use crate::envelope::{Envelope, Payload};
use crate::error::ReplyError;
use crate::headers::{self, ReplyIndex};
use base64::Engine;
use serde::{Deserialize, Serialize};

const ENTRY_BYTES: &str = "bytes";
const ENTRY_TEXT: &str = "text";

/// Encoded size of `{"entries":[]}`.
const CONTAINER_OVERHEAD: usize = 14;
/// Encoded size of `{"type":"bytes","data":""}`.
const ENTRY_OVERHEAD: usize = 26;

/// Encoded size of one `bytes` entry carrying `raw_len` bytes.
fn encoded_entry_len(raw_len: usize) -> usize {
    ENTRY_OVERHEAD + raw_len.div_ceil(3) * 4
}

/// Contiguous run of replies packed into one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyGroup {
    pub start: u64,
    pub entries: Vec<Vec<u8>>,
}

impl ReplyGroup {
    /// Inclusive range covered by this group.
    pub fn index(&self) -> ReplyIndex {
        let end = self.start + self.entries.len().saturating_sub(1) as u64;
        ReplyIndex::Range {
            start: self.start,
            end,
        }
    }

    pub fn payload_bytes(&self) -> usize {
        self.entries.iter().map(Vec::len).sum()
    }

    /// Size of the payload [`into_envelope`](Self::into_envelope) produces.
    pub fn encoded_len(&self) -> usize {
        CONTAINER_OVERHEAD
            + self
                .entries
                .iter()
                .map(|entry| encoded_entry_len(entry.len()))
                .sum::<usize>()
            + self.entries.len().saturating_sub(1)
    }

    /// Encode as a group envelope carrying `base`'s headers.
    pub fn into_envelope(self, base: Envelope) -> Result<Envelope, ReplyError> {
        let index = self.index();
        let container = GroupContainer {
            entries: self
                .entries
                .iter()
                .map(|data| GroupEntry {
                    kind: ENTRY_BYTES.to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&container)
            .map_err(|e| ReplyError::unsupported(format!("encode group: {e}")))?;
        Ok(base
            .with_payload(Payload::Bytes(body))
            .with_header(headers::REPLY_GROUP, true)
            .with_header(headers::REPLY_INDEX, index.to_string()))
    }
}

/// Outcome of packing a batch of replies.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunking {
    Grouped(Vec<ReplyGroup>),
    /// Send one reply per message, in the original order.
    Ungrouped(Vec<Payload>),
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupContainer {
    entries: Vec<GroupEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupEntry {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

/// Pack `replies` into the fewest contiguous groups whose encoded group
/// payload (container plus base64 entries) stays within `max_bytes`.
///
/// A reply too large to fit the budget on its own gets a group of its own. If any reply is not
/// raw bytes the whole batch is returned ungrouped, as it is when `max_bytes`
/// is zero.
pub fn chunk(replies: Vec<Payload>, max_bytes: usize) -> Chunking {
    if max_bytes == 0 || replies.is_empty() {
        return Chunking::Ungrouped(replies);
    }
    if let Some(position) = replies.iter().position(|reply| reply.as_bytes().is_none()) {
        tracing::debug!(
            position,
            count = replies.len(),
            "reply is not raw bytes; sending batch ungrouped"
        );
        return Chunking::Ungrouped(replies);
    }

    let mut groups: Vec<ReplyGroup> = Vec::new();
    let mut current = ReplyGroup {
        start: 0,
        entries: Vec::new(),
    };
    let mut current_len = CONTAINER_OVERHEAD;

    let byte_replies = replies.into_iter().filter_map(|reply| match reply {
        Payload::Bytes(bytes) => Some(bytes),
        Payload::Json(_) => None,
    });
    for (index, bytes) in byte_replies.enumerate() {
        let entry_len = encoded_entry_len(bytes.len());
        if !current.entries.is_empty() {
            if current_len + 1 + entry_len > max_bytes {
                groups.push(std::mem::replace(
                    &mut current,
                    ReplyGroup {
                        start: index as u64,
                        entries: Vec::new(),
                    },
                ));
                current_len = CONTAINER_OVERHEAD;
            } else {
                // separator
                current_len += 1;
            }
        }
        current_len += entry_len;
        current.entries.push(bytes);
    }
    groups.push(current);

    Chunking::Grouped(groups)
}

/// Split a group envelope back into one reply envelope per entry.
///
/// Every produced envelope keeps the group's headers; only the payload and
/// `replyIndex` differ. Unknown entry types or a malformed container abort the
/// whole group with [`ReplyError::UnsupportedPayload`].
pub fn unpack(envelope: &Envelope) -> Result<Vec<Envelope>, ReplyError> {
    let container: GroupContainer = match envelope.payload() {
        Payload::Bytes(bytes) => serde_json::from_slice(bytes),
        Payload::Json(value) => serde_json::from_value(value.clone()),
    }
    .map_err(|e| ReplyError::unsupported(format!("malformed group container: {e}")))?;

    let declared = headers::reply_index(envelope);
    if let Some(ReplyIndex::Range { start, end }) = declared {
        if declared.map(ReplyIndex::span) != Some(container.entries.len() as u64) {
            return Err(ReplyError::unsupported(format!(
                "group declares range {start}-{end} but carries {} entries",
                container.entries.len()
            )));
        }
    }
    let start = declared.map_or(0, ReplyIndex::start);

    let shared = headers::without_group_flag(envelope.clone());
    container
        .entries
        .into_iter()
        .enumerate()
        .map(|(offset, entry)| -> Result<Envelope, ReplyError> {
            let payload = decode_entry(entry)?;
            Ok(shared
                .clone()
                .with_payload(payload)
                .with_header(
                    headers::REPLY_INDEX,
                    start.saturating_add(offset as u64).to_string(),
                ))
        })
        .collect()
}

fn decode_entry(entry: GroupEntry) -> Result<Payload, ReplyError> {
    match entry.kind.as_str() {
        ENTRY_BYTES => base64::engine::general_purpose::STANDARD
            .decode(entry.data.as_bytes())
            .map(Payload::Bytes)
            .map_err(|e| ReplyError::unsupported(format!("invalid base64 entry: {e}"))),
        ENTRY_TEXT => Ok(Payload::text(entry.data)),
        other => Err(ReplyError::unsupported(format!("unknown entry type `{other}`"))),
    }
}
