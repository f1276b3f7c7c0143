/*
    errors.rs - Error types for the broadcast subsystem

    Only request-level failures are errors here. Per-recipient failures are
    data: they become `RecipientError` entries in the result map and never
    fail the broadcast as a whole.
*/

use std::fmt;
use thiserror::Error;

/// A broadcast limit that rejected the request before any dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitViolation {
    TooManyRecipients { count: usize, max: usize },
    MessageTooLarge { size: usize, max: usize },
    TotalTooLarge { total: usize, max: usize },
}

impl fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitViolation::TooManyRecipients { count, max } => {
                write!(f, "{} recipients requested, at most {} allowed", count, max)
            }
            LimitViolation::MessageTooLarge { size, max } => {
                write!(f, "message exceeds {} bytes (read {} so far)", max, size)
            }
            LimitViolation::TotalTooLarge { total, max } => write!(
                f,
                "message size times recipient count exceeds {} bytes (at least {})",
                max, total
            ),
        }
    }
}

/// Errors that fail a whole broadcast request
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Broadcast rejected: {0}")]
    LimitExceeded(LimitViolation),

    /// Reading the inbound message or writing the reply envelope failed
    #[error("Broadcast I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode reply envelope: {0}")]
    Encode(#[from] EncodeError),
}

/// Errors raised by a node while handling a message
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Node I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node failed: {0}")]
    Failed(String),
}

/// Wire decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Truncated input: {needed} bytes needed at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("Unknown type tag 0x{tag:02x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("Nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("Invalid UTF-8 in string at offset {0}")]
    InvalidUtf8(usize),

    #[error("Integer at offset {offset} has {len} bytes, expected 8")]
    InvalidInteger { offset: usize, len: usize },

    #[error("Object key at offset {offset} is not a string (tag 0x{tag:02x})")]
    InvalidKey { offset: usize, tag: u8 },

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("Invalid reply envelope: {0}")]
    InvalidEnvelope(String),
}

/// Wire encoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("Value of {0} bytes does not fit a 4-byte length")]
    TooLong(usize),
}
