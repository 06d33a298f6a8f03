//! In-process transport backed by a channel.

use crate::transport::{Envelope, Transport};
use crate::utils::{NetworkError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Transport that queues every sent envelope on an unbounded channel
#[derive(Debug)]
pub struct MemoryTransport {
    outbox: mpsc::UnboundedSender<Envelope>,
    failing: AtomicBool,
}

impl MemoryTransport {
    /// Create the transport and the receiving end of its outbox
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, receiver) = mpsc::unbounded_channel();
        (
            Self {
                outbox,
                failing: AtomicBool::new(false),
            },
            receiver,
        )
    }

    /// Make every subsequent send fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionFailed {
                peer: envelope.dest_address,
                reason: "transport disabled".to_string(),
            }
            .into());
        }

        envelope.validate()?;
        self.outbox.send(envelope).map_err(|_| {
            NetworkError::Transport {
                reason: "outbox closed".to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_queues_and_fails() {
        let (transport, mut outbox) = MemoryTransport::new();
        let envelope = Envelope::new("10.0.0.1", "10.0.0.2", "", b"hi".to_vec());

        transport.send(envelope.clone()).await.unwrap();
        assert_eq!(outbox.recv().await.unwrap(), envelope);

        transport.set_failing(true);
        let err = transport.send(envelope).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(outbox.try_recv().is_err());
    }
}
