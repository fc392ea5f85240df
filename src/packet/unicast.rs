use super::{duration_ms, PacketProbe};
use crate::errors::{MonitorError, Result};
use crate::net::resolve_ipv4;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

pub const PAYLOAD: &[u8] = b"UN1C4ST_TEST";

/// Echo service port.
pub const DEFAULT_PORT: u16 = 7;

const REPLY_TIMEOUT: Duration = Duration::from_millis(1000);
const PAUSE: Duration = Duration::from_millis(250);

/// UDP request/reply against a single host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastTarget {
    pub host: String,
    pub port: u16,
}

impl UnicastTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    async fn exchange(&self) -> Result<f64> {
        let ip = resolve_ipv4(&self.host).await?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| MonitorError::io("cannot open UDP socket", e))?;
        socket.connect((ip, self.port)).await.map_err(|e| {
            MonitorError::io(format!("cannot address {}:{}", ip, self.port), e)
        })?;

        let sent_at = Instant::now();
        socket
            .send(PAYLOAD)
            .await
            .map_err(|e| MonitorError::io(format!("send to {} failed", ip), e))?;

        let mut buf = [0u8; 1500];
        match tokio::time::timeout(REPLY_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(_)) => Ok(duration_ms(sent_at.elapsed())),
            Ok(Err(e)) => Err(MonitorError::io(format!("no reply from {}", ip), e)),
            Err(_) => Ok(0.0),
        }
    }
}

impl PacketProbe for UnicastTarget {
    fn pause(&self) -> Duration {
        PAUSE
    }

    fn sample(&self) -> BoxFuture<'_, Result<f64>> {
        self.exchange().boxed()
    }
}
