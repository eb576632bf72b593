//! Correlation engine: pending-request registry, per-request reply
//! accumulation, and the coordinator exposing blocking, future and stream
//! call shapes.

pub mod coordinator;
pub mod handler;
pub mod registry;
pub mod responder;
pub mod sink;
pub mod stats;
pub mod stream;

pub use coordinator::{CoordinatorBuilder, PendingReply, ReplyDisposition, RequestReplyCoordinator};
pub use handler::{DedupWindow, DeliveryOutcome, ReplyMode, ResponseHandler};
pub use registry::CorrelationRegistry;
pub use responder::Responder;
pub use sink::ReplySink;
pub use stats::{CoordinatorStats, CoordinatorStatsSnapshot};
pub use stream::ReplyStream;
