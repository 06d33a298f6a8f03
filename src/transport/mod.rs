//! Envelope transport.
//!
//! The router only depends on the [`Transport`] trait. [`tcp`] carries
//! newline-delimited JSON envelopes between nodes; [`memory`] hands them to
//! a channel, for tests and embedding.

pub mod memory;
pub mod protocol;
pub mod tcp;

pub use memory::MemoryTransport;
pub use protocol::*;
pub use tcp::TcpTransport;

use crate::utils::Result;
use async_trait::async_trait;

/// Outbound envelope delivery
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope to `envelope.dest_address`. Failures are
    /// reported, never retried.
    async fn send(&self, envelope: Envelope) -> Result<()>;
}
