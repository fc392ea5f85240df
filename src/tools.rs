//! One-shot diagnostics: traceroute, connection table and LAN sweep.
//!
//! Each tool reports through a line callback. The first and last lines
//! frame the run; a launch failure becomes an error line and the `Err`
//! is returned as well.

use crate::errors::Result;
use crate::probes::process::run_lines;
use futures::stream::{self, StreamExt};
use log::{debug, info};
use std::io::ErrorKind as IoErrorKind;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;

const TRACEROUTE_DEADLINE: Duration = Duration::from_secs(300);
const NETSTAT_DEADLINE: Duration = Duration::from_secs(60);

/// Reachability checks in flight during a LAN sweep.
pub const LAN_SCAN_CONCURRENCY: usize = 32;
pub const LAN_SCAN_TIMEOUT: Duration = Duration::from_millis(300);

// Echo port: a refusal still proves the host is up.
const REACHABILITY_PORT: u16 = 7;

fn traceroute_command() -> &'static str {
    if cfg!(windows) {
        "tracert"
    } else {
        "traceroute"
    }
}

fn netstat_args() -> &'static [&'static str] {
    if cfg!(windows) {
        &["-ano"]
    } else {
        &["-an"]
    }
}

pub async fn traceroute<F: FnMut(&str)>(host: &str, mut on_line: F) -> Result<()> {
    let program = traceroute_command();
    on_line(&format!("Traceroute started: {} {}", program, host));

    let result = run_lines(program, &[host], TRACEROUTE_DEADLINE, &mut on_line).await;
    if let Err(e) = &result {
        on_line(&format!("Traceroute error: {}", e.message));
    }

    on_line(&format!("Traceroute finished: {}", host));
    result.map(|_| ())
}

pub async fn netstat<F: FnMut(&str)>(mut on_line: F) -> Result<()> {
    let args = netstat_args();
    on_line(&format!("Running netstat {}...", args.join(" ")));

    let result = run_lines("netstat", args, NETSTAT_DEADLINE, &mut on_line).await;
    if let Err(e) = &result {
        on_line(&format!("Netstat error: {}", e.message));
    }

    on_line("Netstat finished.");
    result.map(|_| ())
}

/// Whether `host` answers a TCP handshake on the echo port in time.
pub async fn is_reachable(host: Ipv4Addr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, REACHABILITY_PORT))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => e.kind() == IoErrorKind::ConnectionRefused,
        Err(_) => false,
    }
}

/// Sweep `.1` to `.254` of the /24 around `interface` and return the
/// hosts that answered, in address order.
pub async fn lan_scan<F: FnMut(&str)>(interface: Ipv4Addr, mut on_line: F) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = interface.octets();
    let prefix = format!("{}.{}.{}", a, b, c);

    on_line(&format!("LAN scan started: {}.1-254", prefix));
    info!("LAN scan of {}.0/24", prefix);

    let mut checks = stream::iter(1..=254u8)
        .map(|last| {
            let host = Ipv4Addr::new(a, b, c, last);
            async move { (host, is_reachable(host, LAN_SCAN_TIMEOUT).await) }
        })
        .buffer_unordered(LAN_SCAN_CONCURRENCY);

    let mut found = Vec::new();
    while let Some((host, reachable)) = checks.next().await {
        if reachable {
            debug!("{} is reachable", host);
            on_line(&format!("Reachable: {}", host));
            found.push(host);
        }
    }

    found.sort();
    on_line(&format!("LAN scan finished: {} host(s) reachable.", found.len()));
    found
}
