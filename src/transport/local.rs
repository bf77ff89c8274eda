use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::errors::{Result, XlbError};
use crate::core::layout::Rank;
use crate::transport::message::{Envelope, Message};
use crate::transport::Transport;

/// Encoded message as it sits in a mailbox
#[derive(Debug)]
struct Frame {
    source: Rank,
    bytes: Vec<u8>,
}

/// In-process fabric: one unbounded mailbox per rank.
///
/// A tokio channel preserves order per sender, which gives the per-pair FIFO
/// guarantee the runtime relies on. Messages are bincode-encoded on send so
/// the receive path is the same as for a real wire.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    size: usize,
    mailboxes: Arc<DashMap<Rank, mpsc::UnboundedSender<Frame>>>,
}

impl LocalFabric {
    /// Build a fabric for `size` ranks and hand out one endpoint per rank
    pub fn new(size: usize) -> (Self, Vec<LocalEndpoint>) {
        let fabric = Self {
            size,
            mailboxes: Arc::new(DashMap::new()),
        };
        let endpoints = (0..size)
            .map(|rank| {
                let (tx, rx) = mpsc::unbounded_channel();
                fabric.mailboxes.insert(rank, tx);
                LocalEndpoint {
                    rank,
                    fabric: fabric.clone(),
                    inbox: rx,
                }
            })
            .collect();
        (fabric, endpoints)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Put raw bytes into a mailbox as if `source` had sent them
    pub fn deliver(&self, to: Rank, source: Rank, bytes: Vec<u8>) -> Result<()> {
        let mailbox = self
            .mailboxes
            .get(&to)
            .ok_or_else(|| XlbError::transport(format!("no mailbox for rank {}", to)))?;
        mailbox
            .send(Frame { source, bytes })
            .map_err(|_| XlbError::transport(format!("rank {} has left the run", to)))
    }

    /// Remove a rank's mailbox; later sends to it fail
    pub fn disconnect(&self, rank: Rank) {
        self.mailboxes.remove(&rank);
    }
}

/// One rank's view of a [`LocalFabric`]
#[derive(Debug)]
pub struct LocalEndpoint {
    rank: Rank,
    fabric: LocalFabric,
    inbox: mpsc::UnboundedReceiver<Frame>,
}

impl LocalEndpoint {
    pub fn fabric(&self) -> &LocalFabric {
        &self.fabric
    }
}

#[async_trait]
impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    async fn send(&self, to: Rank, message: &Message) -> Result<()> {
        let bytes = message.encode()?;
        trace!("{} -> {}: {} bytes", self.rank, to, bytes.len());
        self.fabric.deliver(to, self.rank, bytes)
    }

    async fn recv(&mut self) -> Result<Envelope> {
        let frame = self
            .inbox
            .recv()
            .await
            .ok_or_else(|| XlbError::transport("mailbox closed"))?;
        let message = Message::decode(&frame.bytes)?;
        Ok(Envelope {
            source: frame.source,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::Code;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (_fabric, mut endpoints) = LocalFabric::new(2);
        let mut b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();

        a.send(1, &Message::IdleQuery { round: 1 }).await.unwrap();
        a.send(1, &Message::IdleQuery { round: 2 }).await.unwrap();

        let first = b.recv().await.unwrap();
        assert_eq!(first.source, 0);
        assert_eq!(first.message, Message::IdleQuery { round: 1 });
        let second = b.recv().await.unwrap();
        assert_eq!(second.message, Message::IdleQuery { round: 2 });
    }

    #[tokio::test]
    async fn test_malformed_frame_is_an_error() {
        let (fabric, mut endpoints) = LocalFabric::new(1);
        let mut only = endpoints.pop().unwrap();
        fabric.deliver(0, 0, vec![0xff; 3]).unwrap();
        let err = only.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::Error);
    }

    #[tokio::test]
    async fn test_send_to_departed_rank_fails() {
        let (fabric, mut endpoints) = LocalFabric::new(3);
        drop(endpoints.pop());
        let a = endpoints.remove(0);

        let err = a.send(2, &Message::Shutdown).await.unwrap_err();
        assert_eq!(err.code(), Code::Error);

        fabric.disconnect(1);
        assert!(a.send(1, &Message::Shutdown).await.is_err());
        assert!(a.send(7, &Message::Shutdown).await.is_err());
    }
}
