//! Multicast group probe.
//!
//! The socket binds the group port with address reuse so it can coexist
//! with a local responder (mDNS on 5353, for one). Loopback of our own
//! datagram is off unless the target asks for it, which lets a responder
//! on this host answer; the looped-back request itself is never counted.

use super::{drain_replies, duration_ms, PacketProbe};
use crate::errors::{MonitorError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

pub const PAYLOAD: &[u8] = b"MULTICAST_TEST";
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const DEFAULT_PORT: u16 = 5353;

const SILENCE_WINDOW: Duration = Duration::from_millis(1500);
const PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastTarget {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Interface that joins the group; unspecified lets the OS pick.
    pub interface: Ipv4Addr,
    /// Deliver our datagrams to sockets on this host as well.
    pub loopback: bool,
}

impl Default for MulticastTarget {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: false,
        }
    }
}

impl MulticastTarget {
    fn bind(&self) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port).into())?;
        socket.join_multicast_v4(&self.group, &self.interface)?;
        socket.set_multicast_loop_v4(self.loopback)?;

        UdpSocket::from_std(socket.into())
    }

    async fn exchange(&self) -> Result<f64> {
        if !self.group.is_multicast() {
            return Err(MonitorError::config(format!(
                "{} is not a multicast address",
                self.group
            )));
        }

        let socket = self.bind().map_err(|e| {
            MonitorError::io(format!("cannot join {}:{}", self.group, self.port), e)
        })?;

        let sent_at = Instant::now();
        socket
            .send_to(PAYLOAD, SocketAddrV4::new(self.group, self.port))
            .await
            .map_err(|e| MonitorError::io(format!("send to {} failed", self.group), e))?;

        let own = self.loopback.then_some(PAYLOAD);
        let fastest = drain_replies(&socket, sent_at, SILENCE_WINDOW, own).await;

        if let Err(e) = socket.leave_multicast_v4(self.group, self.interface) {
            debug!("Leaving {} failed: {}", self.group, e);
        }

        Ok(fastest.map_or(0.0, duration_ms))
    }
}

impl PacketProbe for MulticastTarget {
    fn pause(&self) -> Duration {
        PAUSE
    }

    fn sample(&self) -> BoxFuture<'_, Result<f64>> {
        self.exchange().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Joins `GROUP` and answers every request to the group after `delay`.
    fn spawn_group_responder(port: u16, delay: Duration) {
        let socket = MulticastTarget {
            group: GROUP,
            port,
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: true,
        }
        .bind()
        .unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((len, _)) = socket.recv_from(&mut buf).await {
                if &buf[..len] != PAYLOAD {
                    continue;
                }
                tokio::time::sleep(delay).await;
                let _ = socket
                    .send_to(b"MULTICAST_REPLY", SocketAddrV4::new(GROUP, port))
                    .await;
            }
        });
    }

    #[tokio::test]
    async fn test_group_exchange_records_fastest_responder() {
        let port = free_port();
        spawn_group_responder(port, Duration::from_millis(80));
        spawn_group_responder(port, Duration::from_millis(10));

        let target = MulticastTarget {
            group: GROUP,
            port,
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: true,
        };

        let begin = Instant::now();
        let value = target.exchange().await.unwrap();

        assert!(value >= 10.0 && value < 80.0, "got {} ms", value);
        // The slow reply restarts the silence window
        assert!(begin.elapsed() >= Duration::from_millis(1580));
    }

    #[tokio::test]
    async fn test_group_without_responder_records_zero() {
        let target = MulticastTarget {
            group: GROUP,
            port: free_port(),
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: true,
        };

        // Our own looped-back request is not a reply
        assert_eq!(target.exchange().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_rejects_unicast_group() {
        let target = MulticastTarget {
            group: Ipv4Addr::new(192, 168, 1, 1),
            ..MulticastTarget::default()
        };

        let err = target.exchange().await.unwrap_err();
        assert!(err.message.contains("not a multicast address"));
    }
}
