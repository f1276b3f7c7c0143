//! Two-level logical addressing for stored documents
//!
//! `(kind, scope)` selects a bucket and `(id, version)` an entry inside it.
//! Both pairs are joined with `:` to form the composite keys written into the
//! index, so no component may contain `:` or be empty.

use super::errors::{StoreError, StoreResult};
use std::fmt;

/// Separator between the two halves of a composite index key
pub const KEY_SEPARATOR: char = ':';

/// The 4-tuple addressing one stored document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalKey {
    pub kind: String,
    pub scope: String,
    pub id: String,
    pub version: String,
}

impl LogicalKey {
    pub fn new(
        kind: impl Into<String>,
        scope: impl Into<String>,
        id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        LogicalKey {
            kind: kind.into(),
            scope: scope.into(),
            id: id.into(),
            version: version.into(),
        }
    }

    /// Check every component
    pub fn validate(&self) -> StoreResult<()> {
        check_component("kind", &self.kind)?;
        check_component("scope", &self.scope)?;
        check_component("id", &self.id)?;
        check_component("version", &self.version)
    }

    /// `kind:scope`
    pub fn bucket_key(&self) -> String {
        join(&self.kind, &self.scope)
    }

    /// `id:version`
    pub fn entry_key(&self) -> String {
        join(&self.id, &self.version)
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket_key(), self.entry_key())
    }
}

/// Validated composite key for a whole bucket
pub fn bucket_key(kind: &str, scope: &str) -> StoreResult<String> {
    check_component("kind", kind)?;
    check_component("scope", scope)?;
    Ok(join(kind, scope))
}

fn join(a: &str, b: &str) -> String {
    format!("{}{}{}", a, KEY_SEPARATOR, b)
}

fn check_component(name: &str, value: &str) -> StoreResult<()> {
    if value.is_empty() {
        return Err(StoreError::InvalidKey(format!("{} must not be empty", name)));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(StoreError::InvalidKey(format!(
            "{} must not contain '{}': {:?}",
            name, KEY_SEPARATOR, value
        )));
    }
    Ok(())
}
