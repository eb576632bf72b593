#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_wraps
)]

pub mod chunker;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod headers;
pub mod loopback;
pub mod transport;

pub use config::Config;
pub use correlation::{
    CorrelationRegistry, ReplyDisposition, ReplyStream, RequestReplyCoordinator, Responder,
};
pub use envelope::{Envelope, HeaderValue, Payload};
pub use error::ReplyError;
pub use headers::{ReplyIndex, ReplyInfo, TotalReplies};
pub use transport::{InMemoryBroker, Transport};
