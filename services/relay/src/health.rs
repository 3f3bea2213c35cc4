//! TCP health endpoint.
//!
//! Any connection gets `OK\n` and is closed. No request is read.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::error::RelayError;

/// Body written to every health connection.
pub const HEALTH_RESPONSE: &[u8] = b"OK\n";

/// Upper bound on writing the response to one connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP listener answering load balancer health checks.
pub struct HealthListener {
    listener: TcpListener,
}

impl HealthListener {
    /// Bind the health socket. Failure here is fatal to the process.
    pub async fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(Self { listener })
    }

    /// Bound address (resolves port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Answer health checks until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Health listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => {
                    info!(bind_addr = %local_addr, "Health listener stopped");
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(async move {
                        if let Err(e) = respond(stream).await {
                            debug!(peer_addr = %peer_addr, error = %e, "Health response failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Health accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn respond(mut stream: TcpStream) -> io::Result<()> {
    timeout(WRITE_TIMEOUT, async {
        stream.write_all(HEALTH_RESPONSE).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "health write timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_responds_ok_and_closes() {
        let health = HealthListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = health.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(health.run(rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, HEALTH_RESPONSE);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let health = HealthListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(health.run(rx));

        tx.send(true).unwrap();
        let result = timeout(Duration::from_secs(1), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
