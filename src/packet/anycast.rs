use super::{duration_ms, PacketProbe};
use crate::errors::Result;
use crate::probes::{HttpTimer, LatencyProvider, ProbeSet};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

const PAUSE: Duration = Duration::from_millis(1000);

/// An anycast service reached by address and by HTTPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnycastTarget {
    pub name: String,
    pub host: String,
    pub trace_url: String,
}

impl AnycastTarget {
    pub fn cloudflare() -> Self {
        Self {
            name: "Cloudflare".to_string(),
            host: "1.1.1.1".to_string(),
            trace_url: "https://1.1.1.1/cdn-cgi/trace".to_string(),
        }
    }

    pub fn google() -> Self {
        Self {
            name: "Google".to_string(),
            host: "8.8.8.8".to_string(),
            trace_url: "https://dns.google/dns-query".to_string(),
        }
    }
}

/// Merge the ping and HTTP timings of one iteration into a single sample.
pub fn combine(ping_ms: Option<f64>, http_ms: Option<f64>) -> f64 {
    match (ping_ms, http_ms) {
        (Some(ping), Some(http)) => (ping + http) / 2.0,
        (Some(ping), None) => ping,
        (None, Some(http)) => http,
        (None, None) => 0.0,
    }
}

pub(crate) struct AnycastProbe {
    target: AnycastTarget,
    latency: Arc<dyn LatencyProvider>,
    http: HttpTimer,
}

impl AnycastProbe {
    pub(crate) fn new(target: AnycastTarget, probes: &ProbeSet) -> Self {
        Self {
            target,
            latency: probes.latency.clone(),
            http: probes.http.clone(),
        }
    }

    async fn exchange(&self) -> Result<f64> {
        let ping_ms = self.latency.probe(&self.target.host).await.rtt_ms();
        let http_ms = match self.http.measure(&self.target.trace_url).await {
            Ok(elapsed) => Some(duration_ms(elapsed)),
            Err(e) => {
                debug!("{} HTTP timing failed: {}", self.target.name, e);
                None
            }
        };

        debug!(
            "{}: ping={:?} ms, http={:?} ms",
            self.target.name, ping_ms, http_ms
        );

        Ok(combine(ping_ms, http_ms))
    }
}

impl PacketProbe for AnycastProbe {
    fn pause(&self) -> Duration {
        PAUSE
    }

    fn sample(&self) -> BoxFuture<'_, Result<f64>> {
        self.exchange().boxed()
    }
}
