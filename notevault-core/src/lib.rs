//! NoteVault backend engine
//!
//! - [`core_crypto`]: AES-256-GCM envelopes and master keys
//! - [`core_store`]: encrypted keyed document store with key rotation
//! - [`core_broadcast`]: in-process fan-out of one message to many nodes

pub mod config;
pub mod core_broadcast;
pub mod core_crypto;
pub mod core_store;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use core_broadcast::{Broadcaster, NodeId, NodeRegistry};
pub use core_crypto::MasterKey;
pub use core_store::{DataStore, LogicalKey};
pub use logging::{init_logging, LogLevel};
