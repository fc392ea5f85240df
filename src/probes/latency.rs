//! Round-trip latency providers.
//!
//! [`PingCommand`] shells out to the system `ping` for a single echo and
//! scrapes the reply time from its output. The recognised tokens are
//! `time=`, `time<`, `idő=` and `idő<` (case-insensitive), followed by a
//! number and `ms`. Any other locale parses as no response, which is why
//! [`TcpConnectProbe`] exists: it times a TCP handshake instead and needs
//! no text parsing at all.

use super::process::capture_lines;
use super::LatencyProvider;
use crate::measurements::LatencySample;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Upper bound on a single `ping` invocation.
const PING_PROCESS_DEADLINE: Duration = Duration::from_secs(10);

const TIME_TOKENS: [&str; 4] = ["time=", "time<", "idő=", "idő<"];

/// Single-echo ping through the operating system's `ping` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingCommand;

impl PingCommand {
    fn args(host: &str) -> Vec<&str> {
        if cfg!(windows) {
            vec!["-n", "1", host]
        } else {
            vec!["-c", "1", host]
        }
    }

    async fn run(host: &str) -> LatencySample {
        match capture_lines("ping", &Self::args(host), PING_PROCESS_DEADLINE).await {
            Ok(lines) => lines
                .iter()
                .find_map(|line| parse_reply_time(line))
                .map(LatencySample::from_ms)
                .unwrap_or(LatencySample::NoResponse),
            Err(e) => {
                debug!("ping {} failed: {}", host, e);
                LatencySample::NoResponse
            }
        }
    }
}

impl LatencyProvider for PingCommand {
    fn probe<'a>(&'a self, host: &'a str) -> BoxFuture<'a, LatencySample> {
        Self::run(host).boxed()
    }
}

/// Extract the reply time in milliseconds from one line of ping output.
pub fn parse_reply_time(line: &str) -> Option<f64> {
    let lower = line.to_lowercase();

    let (idx, token) = TIME_TOKENS
        .iter()
        .find_map(|token| lower.find(token).map(|idx| (idx, *token)))?;

    let rest = &lower[idx + token.len()..];
    let ms_idx = rest.find("ms")?;

    let number: String = rest[..ms_idx]
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();

    number.parse::<f64>().ok()
}

/// Latency measured as the duration of a TCP handshake.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnectProbe {
    pub port: u16,
    pub timeout: Duration,
}

impl TcpConnectProbe {
    pub const DEFAULT_PORT: u16 = 443;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

    pub fn new(port: u16) -> Self {
        Self { port, timeout: Self::DEFAULT_TIMEOUT }
    }

    async fn run(&self, host: &str) -> LatencySample {
        let start = Instant::now();

        match tokio::time::timeout(self.timeout, TcpStream::connect((host, self.port)))
            .await
        {
            Ok(Ok(stream)) => {
                let rtt = start.elapsed();
                drop(stream);
                LatencySample::Reply(rtt)
            }
            Ok(Err(e)) => {
                debug!("TCP connect to {}:{} failed: {}", host, self.port, e);
                LatencySample::NoResponse
            }
            Err(_) => {
                debug!("TCP connect to {}:{} timed out", host, self.port);
                LatencySample::NoResponse
            }
        }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PORT)
    }
}

impl LatencyProvider for TcpConnectProbe {
    fn probe<'a>(&'a self, host: &'a str) -> BoxFuture<'a, LatencySample> {
        self.run(host).boxed()
    }
}
