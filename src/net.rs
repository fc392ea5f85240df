//! Local interface addressing and host resolution.

use crate::errors::{MonitorError, Result};
use hickory_resolver::TokioResolver;
use log::debug;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

// Connecting a UDP socket sends nothing; it only selects a route.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// IPv4 address of the interface that routes to the internet.
pub async fn local_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| MonitorError::io("cannot open route probe socket", e))?;
    socket.connect(ROUTE_PROBE_ADDR).await.map_err(|e| {
        MonitorError::network(format!("no route to {}", ROUTE_PROBE_ADDR))
            .with_suggestion("Check that a network interface is up")
            .with_source(e)
    })?;

    match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) if !addr.ip().is_unspecified() => {
            debug!("Local IPv4: {}", addr.ip());
            Ok(*addr.ip())
        }
        Ok(addr) => Err(MonitorError::network(format!(
            "no usable local IPv4 address (got {})",
            addr
        ))),
        Err(e) => Err(MonitorError::io("cannot read local address", e)),
    }
}

/// Broadcast address of the /24 around `ip`.
pub fn broadcast_address(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// The first IPv4 address of `host`, which may already be a literal.
pub async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let resolver = TokioResolver::builder_tokio()
        .map_err(|e| MonitorError::network("cannot create DNS resolver").with_source(e))?
        .build();

    let response = resolver.lookup_ip(host).await.map_err(|e| {
        MonitorError::dns(format!("cannot resolve {}", host)).with_source(e)
    })?;

    response
        .iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            MonitorError::dns(format!("{} has no IPv4 address", host))
        })
}
