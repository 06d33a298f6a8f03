//! Newline-delimited JSON envelopes over TCP.
//!
//! Each send opens a connection to the destination, writes one envelope
//! line and closes. The listener accepts any number of lines per
//! connection and hands each parsed envelope to a handler on the
//! connection's task; a bad line is logged and skipped.

use crate::transport::{Envelope, Transport};
use crate::utils::{MessengerError, NetworkError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Transport dialling peers on a fixed port
#[derive(Debug, Clone)]
pub struct TcpTransport {
    port: u16,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Dial peers on `port`, giving up on a connection after `connect_timeout`
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    /// Socket address for a peer address. An address that already names a
    /// port is used as is.
    pub fn target(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            address.to_string()
        } else {
            format!("{address}:{}", self.port)
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let mut line = envelope.to_json()?;
        line.push('\n');

        let target = self.target(&envelope.dest_address);
        let connect = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::ConnectionFailed {
                    peer: target,
                    reason: e.to_string(),
                }
                .into())
            }
            Err(_) => {
                return Err(NetworkError::Timeout {
                    operation: format!("connect to {target}"),
                }
                .into())
            }
        };

        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: target.clone(),
                reason: e.to_string(),
            })?;
        stream.shutdown().await.map_err(|e| NetworkError::Transport {
            reason: e.to_string(),
        })?;

        log::trace!("Sent {} byte envelope to {target}", line.len());
        Ok(())
    }
}

/// Bind the envelope listener
pub async fn bind(bind_address: &str, port: u16) -> Result<TcpListener> {
    let address = format!("{bind_address}:{port}");
    TcpListener::bind(&address).await.map_err(|e| {
        NetworkError::Transport {
            reason: format!("cannot listen on {address}: {e}"),
        }
        .into()
    })
}

/// Accept connections forever, feeding every envelope to `handler`
pub async fn serve<F, Fut>(listener: TcpListener, max_envelope_size: usize, handler: F) -> Result<()>
where
    F: Fn(Envelope) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    loop {
        let (stream, remote) = listener.accept().await.map_err(|e| NetworkError::Transport {
            reason: format!("accept failed: {e}"),
        })?;
        log::debug!("Accepted connection from {remote}");

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, max_envelope_size, handler).await {
                log::warn!("Connection from {remote} closed: {e}");
            }
        });
    }
}

async fn handle_connection<F, Fut>(
    stream: TcpStream,
    max_envelope_size: usize,
    handler: F,
) -> Result<()>
where
    F: Fn(Envelope) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut reader = BufReader::new(stream);
    // Base64 grows the payload by a third; leave room for the JSON fields.
    let limit = (max_envelope_size / 3 * 4 + 4096) as u64;

    loop {
        let mut line = String::new();
        let read = (&mut reader).take(limit).read_line(&mut line).await?;
        if read == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') && read as u64 >= limit {
            return Err(NetworkError::Transport {
                reason: format!("envelope line exceeds {limit} bytes"),
            }
            .into());
        }

        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        match Envelope::from_json(line) {
            Ok(envelope) => {
                if let Err(e) = handler(envelope).await {
                    log_handler_error(&e);
                }
            }
            Err(e) => log::warn!("Dropping undecodable envelope: {e}"),
        }
    }
}

fn log_handler_error(error: &MessengerError) {
    if error.is_recoverable() || error.is_session_fatal() {
        log::warn!("Envelope dropped: {error}");
    } else {
        log::error!("Envelope handling failed: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_target_uses_default_port() {
        let transport = TcpTransport::new(4242, Duration::from_secs(1));
        assert_eq!(transport.target("10.0.0.2"), "10.0.0.2:4242");
        assert_eq!(transport.target("10.0.0.2:5000"), "10.0.0.2:5000");
        assert_eq!(transport.target("peer.local"), "peer.local:4242");
    }

    #[tokio::test]
    async fn test_tcp_round_trip_through_listener() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx = Arc::new(tx);
        tokio::spawn(serve(listener, crate::MAX_MESSAGE_SIZE, move |envelope| {
            let tx = Arc::clone(&tx);
            async move {
                tx.send(envelope).ok();
                Ok::<(), MessengerError>(())
            }
        }));

        let transport = TcpTransport::new(port, Duration::from_secs(2));
        let envelope = Envelope::new(
            "127.0.0.1",
            "127.0.0.1",
            "aa:bb:cc:dd:ee:ff",
            b"?OTRv3?".to_vec(),
        );
        transport.send(envelope.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(port, Duration::from_secs(2));
        let envelope = Envelope::new("127.0.0.1", "127.0.0.1", "", b"x".to_vec());
        assert!(transport.send(envelope).await.is_err());
    }
}
