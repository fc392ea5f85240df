use super::{drain_replies, duration_ms, PacketProbe};
use crate::errors::{MonitorError, Result};
use crate::net::broadcast_address;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

pub const PAYLOAD: &[u8] = b"BR0ADCAST_TEST";
pub const DEFAULT_PORT: u16 = 55555;

const SILENCE_WINDOW: Duration = Duration::from_millis(1000);
const PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastTarget {
    pub destination: SocketAddrV4,
}

impl BroadcastTarget {
    /// The /24 broadcast address around `interface`, on the default port.
    pub fn for_interface(interface: Ipv4Addr) -> Self {
        Self {
            destination: SocketAddrV4::new(broadcast_address(interface), DEFAULT_PORT),
        }
    }

    async fn exchange(&self) -> Result<f64> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| MonitorError::io("cannot open UDP socket", e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| MonitorError::io("cannot enable broadcast", e))?;

        let sent_at = Instant::now();
        socket.send_to(PAYLOAD, self.destination).await.map_err(|e| {
            MonitorError::io(format!("broadcast to {} failed", self.destination), e)
        })?;

        Ok(drain_replies(&socket, sent_at, SILENCE_WINDOW, None)
            .await
            .map_or(0.0, duration_ms))
    }
}

impl PacketProbe for BroadcastTarget {
    fn pause(&self) -> Duration {
        PAUSE
    }

    fn sample(&self) -> BoxFuture<'_, Result<f64>> {
        self.exchange().boxed()
    }
}
