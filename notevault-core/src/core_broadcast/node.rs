//! Node identifiers and the handle capability
//!
//! A node is anything that can consume one message and produce one reply.
//! The broadcaster talks to it over a pair of in-process duplex pipes.

use super::errors::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Identifier of a registered node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

/// Capability to accept a message and produce a reply
///
/// Implementations read `inbound` until EOF, write their reply into
/// `outbound`, and return. The reply ends when `outbound` is dropped.
/// Implementations must drain `inbound`; closing it early fails the
/// delivery with a write error.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    async fn handle(&self, inbound: DuplexStream, outbound: DuplexStream) -> Result<(), NodeError>;
}

/// Node that replies with the message it received
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoNode;

#[async_trait]
impl NodeHandle for EchoNode {
    async fn handle(
        &self,
        mut inbound: DuplexStream,
        mut outbound: DuplexStream,
    ) -> Result<(), NodeError> {
        let mut message = Vec::new();
        inbound.read_to_end(&mut message).await?;
        outbound.write_all(&message).await?;
        outbound.shutdown().await?;
        Ok(())
    }
}
