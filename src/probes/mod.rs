use crate::config::{HTTP_CONNECT_TIMEOUT, HTTP_READ_TIMEOUT};
use crate::errors::Result;
use crate::measurements::LatencySample;
use futures::future::BoxFuture;
use reqwest::Client;
use std::sync::Arc;

pub mod http_timer;
pub mod latency;
pub mod process;
pub mod throughput;

pub use http_timer::HttpTimer;
pub use latency::{PingCommand, TcpConnectProbe};
pub use throughput::ThroughputProbe;

pub(crate) static UA: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Source of single round-trip latency measurements.
///
/// A failed or unparseable probe is reported as
/// [`LatencySample::NoResponse`], never as an error.
pub trait LatencyProvider: Send + Sync {
    fn probe<'a>(&'a self, host: &'a str) -> BoxFuture<'a, LatencySample>;
}

impl<P: LatencyProvider + ?Sized> LatencyProvider for &P {
    fn probe<'a>(&'a self, host: &'a str) -> BoxFuture<'a, LatencySample> {
        (**self).probe(host)
    }
}

impl<P: LatencyProvider + ?Sized> LatencyProvider for Arc<P> {
    fn probe<'a>(&'a self, host: &'a str) -> BoxFuture<'a, LatencySample> {
        (**self).probe(host)
    }
}

/// HTTP client shared by the throughput probe and the HTTP timer.
pub fn http_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(UA)
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .read_timeout(HTTP_READ_TIMEOUT)
        .build()
}

/// The probes a monitor tick or packet loop draws on.
#[derive(Clone)]
pub struct ProbeSet {
    pub latency: Arc<dyn LatencyProvider>,
    pub throughput: ThroughputProbe,
    pub http: HttpTimer,
}

impl ProbeSet {
    pub fn new(latency: Arc<dyn LatencyProvider>, client: Client) -> Self {
        Self {
            latency,
            throughput: ThroughputProbe::new(client.clone()),
            http: HttpTimer::new(client),
        }
    }

    /// System `ping` for latency and a shared HTTP client for the rest.
    pub fn system() -> Result<Self> {
        Ok(Self::new(Arc::new(PingCommand), http_client()?))
    }
}
