// Point-to-point message passing between ranks

pub mod local;
pub mod message;

use async_trait::async_trait;

use crate::core::errors::Result;
use crate::core::layout::Rank;

pub use local::{LocalEndpoint, LocalFabric};
pub use message::{Envelope, IdleReport, Message, Reply, Request};

/// Reliable, per-pair FIFO delivery addressed by rank
#[async_trait]
pub trait Transport: Send + Sync {
    /// Rank of this endpoint
    fn rank(&self) -> Rank;

    /// Total number of ranks in the run
    fn size(&self) -> usize;

    /// Deliver a message to `to`; fails when the peer is gone
    async fn send(&self, to: Rank, message: &Message) -> Result<()>;

    /// Wait for the next inbound message from any rank
    async fn recv(&mut self) -> Result<Envelope>;
}
