//! In-process broadcast: node registry, fan-out engine and reply wire format
//!
//! A caller hands the [`Broadcaster`] one message and a list of node ids.
//! Every registered node gets the message over its own duplex pipe pair and
//! the replies come back as one [`ReplyEnvelope`] with an entry per node.

pub mod engine;
pub mod errors;
pub mod node;
pub mod registry;
pub mod wire;

pub use engine::{BroadcastLimits, BroadcastOutcome, BroadcastState, Broadcaster};
pub use errors::{BroadcastError, DecodeError, EncodeError, LimitViolation, NodeError};
pub use node::{EchoNode, NodeHandle, NodeId};
pub use registry::NodeRegistry;
pub use wire::{FailureStage, MessageKind, RecipientError, ReplyEnvelope, ReplyPayload, Value};
