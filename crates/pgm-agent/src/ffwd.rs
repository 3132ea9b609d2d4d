//! FFWD transport: one UDP datagram of JSON per record.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use pgm_engine::MetricRecord;
use tokio::net::{UdpSocket, lookup_host};
use tracing::debug;

use crate::config::FfwdConfig;
use crate::error::{AgentError, Result};

/// Sends metric batches to an FFWD agent.
#[derive(Debug, Clone)]
pub struct FfwdSink {
    address: String,
}

impl FfwdSink {
    /// Creates a sink for `host:port`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Creates a sink from configuration.
    #[must_use]
    pub fn from_config(config: &FfwdConfig) -> Self {
        Self::new(config.address())
    }

    /// Returns the destination address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends every record of `batch`, in order, from a fresh local socket.
    ///
    /// The socket stays unconnected so an ICMP error from an absent listener
    /// does not fail the datagrams that follow.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve, or on the first
    /// record that cannot be encoded or sent; the rest of the batch is dropped.
    pub async fn send(&self, batch: &[MetricRecord]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let destination = lookup_host(self.address.as_str())
            .await
            .map_err(|e| AgentError::Transport(format!("cannot resolve ffwd at {}: {e}", self.address)))?
            .next()
            .ok_or_else(|| AgentError::Transport(format!("no address for ffwd at {}", self.address)))?;
        let socket = UdpSocket::bind(local_bind_address(&destination)).await?;

        for record in batch {
            let payload = serde_json::to_vec(record)?;
            debug!(address = %destination, bytes = payload.len(), "sending UDP packet");
            socket
                .send_to(&payload, destination)
                .await
                .map_err(|e| AgentError::Transport(format!("send to {destination} failed: {e}")))?;
        }
        Ok(batch.len())
    }
}

/// Unspecified local address of the same family as `destination`.
fn local_bind_address(destination: &SocketAddr) -> SocketAddr {
    match destination {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    #[test]
    fn test_default_address() {
        let sink = FfwdSink::from_config(&FfwdConfig::default());
        assert_eq!(sink.address(), "127.0.0.1:19000");
    }

    #[tokio::test]
    async fn test_each_record_is_one_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
        let address = receiver.local_addr().expect("local addr").to_string();
        let sink = FfwdSink::new(address);

        let batch = vec![
            metrics::client_connections(12.0),
            metrics::database_size("orders", 4096.0),
        ];
        assert_eq!(sink.send(&batch).await.expect("send"), 2);

        let mut buf = vec![0u8; 2048];
        for expected in &batch {
            let len = receiver.recv(&mut buf).await.expect("recv");
            let received: MetricRecord = serde_json::from_slice(&buf[..len]).expect("valid json");
            assert_eq!(&received, expected);
        }
    }

    #[test]
    fn test_bind_address_follows_destination_family() {
        let v4: SocketAddr = "10.0.0.1:19000".parse().expect("v4");
        let v6: SocketAddr = "[::1]:19000".parse().expect("v6");
        assert_eq!(local_bind_address(&v4).to_string(), "0.0.0.0:0");
        assert_eq!(local_bind_address(&v6).to_string(), "[::]:0");
    }

    #[tokio::test]
    async fn test_absent_listener_does_not_fail_the_batch() {
        let closed = {
            let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
            socket.local_addr().expect("local addr")
        };
        let sink = FfwdSink::new(closed.to_string());
        let batch: Vec<_> = (0..50).map(|i| metrics::client_connections(f64::from(i))).collect();

        assert_eq!(sink.send(&batch).await.expect("first batch"), 50);
        assert_eq!(sink.send(&batch).await.expect("second batch"), 50);
    }

    #[tokio::test]
    async fn test_unresolvable_address_is_transport_error() {
        let sink = FfwdSink::new("not an address");
        let err = sink
            .send(&[metrics::client_connections(1.0)])
            .await
            .expect_err("must not resolve");
        assert!(matches!(err, AgentError::Transport(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let sink = FfwdSink::new("127.0.0.1:9");
        assert_eq!(sink.send(&[]).await.expect("send"), 0);
    }
}
