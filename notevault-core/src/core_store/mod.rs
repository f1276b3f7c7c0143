/*
    core_store - Encrypted keyed document store

    Many logical datasets share one encrypted index while living in separate
    encrypted files:
    - logical_key: the (kind, scope, id, version) address
    - index: encrypted index, filename allocation, key rotation
    - data_store: two-lock facade with blocking and async operations
    - credentials: salt persistence for password-derived keys
    - atomic / journal: crash-safe replacement and rotation resume
*/

mod atomic;
pub mod credentials;
pub mod data_store;
pub mod errors;
pub mod index;
mod journal;
pub mod logical_key;

pub use credentials::{SALT_FILE, STAGED_SALT_FILE};
pub use data_store::{DataStore, StoreStats};
pub use errors::{StoreError, StoreResult};
pub use index::{
    FileIndex, IndexBucket, IndexDocument, IndexEntry, RemovalReport, RotationReport,
    MAX_NAME_ATTEMPTS,
};
pub use journal::JOURNAL_FILE;
pub use logical_key::{LogicalKey, KEY_SEPARATOR};
