//! UPnP port mapping through an Internet gateway.
//!
//! One invocation walks four steps: SSDP discovery, descriptor fetch,
//! WANIPConnection control URL lookup and the SOAP call. The first failing
//! step ends the invocation with its own diagnosis. Nothing is retried.

use crate::config::UPNP_HTTP_TIMEOUT;
use crate::errors::{ErrorKind, MonitorError, Result};
use crate::probes::UA;
use crate::sink::MonitorSink;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::StatusCode;
use log::{info, warn};
use reqwest::Client;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use url::Url;

pub mod descriptor;
pub mod soap;
pub mod ssdp;

pub use soap::{PortMapping, PortMappingAction, Protocol};

pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(3000);

/// Status and body of the gateway's answer to a SOAP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Why an invocation stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpnpFailure {
    NoGateway,
    Discovery(String),
    MissingLocation,
    Descriptor(String),
    NoWanIpService,
    InvalidControlUrl(String),
    Soap(String),
    Rejected(SoapResponse),
}

impl fmt::Display for UpnpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpnpFailure::NoGateway => write!(
                f,
                "no UPnP gateway found: SSDP timed out, the router may lack UPnP or have it disabled"
            ),
            UpnpFailure::Discovery(e) => write!(f, "SSDP discovery failed: {}", e),
            UpnpFailure::MissingLocation => {
                write!(f, "SSDP reply has no LOCATION header")
            }
            UpnpFailure::Descriptor(e) => {
                write!(f, "device descriptor unavailable: {}", e)
            }
            UpnpFailure::NoWanIpService => {
                write!(f, "no WANIPConnection control URL in the device descriptor")
            }
            UpnpFailure::InvalidControlUrl(e) => write!(f, "invalid control URL: {}", e),
            UpnpFailure::Soap(e) => write!(f, "SOAP request failed: {}", e),
            UpnpFailure::Rejected(response) => {
                write!(f, "gateway rejected the request with HTTP {}", response.status)
            }
        }
    }
}

impl From<UpnpFailure> for MonitorError {
    fn from(failure: UpnpFailure) -> Self {
        let kind = match failure {
            UpnpFailure::NoGateway => ErrorKind::Timeout,
            UpnpFailure::Discovery(_) | UpnpFailure::Soap(_) => ErrorKind::Network,
            _ => ErrorKind::Protocol,
        };
        MonitorError::new(kind, failure.to_string())
    }
}

/// Transcript and outcome of one invocation.
#[derive(Debug, Clone)]
pub struct UpnpReport {
    pub action: &'static str,
    pub transcript: Vec<String>,
    pub outcome: std::result::Result<SoapResponse, UpnpFailure>,
}

impl UpnpReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// The network operations behind the four steps.
pub trait UpnpTransport: Send + Sync {
    /// Send an M-SEARCH and return the first reply, or `None` when nothing
    /// arrived in time.
    fn discover(&self) -> BoxFuture<'_, Result<Option<String>>>;

    fn fetch_descriptor<'a>(&'a self, location: &'a Url) -> BoxFuture<'a, Result<String>>;

    fn post_soap<'a>(
        &'a self,
        control: &'a Url,
        action: &'a PortMappingAction,
    ) -> BoxFuture<'a, Result<SoapResponse>>;
}

/// SSDP over UDP and HTTP through reqwest.
#[derive(Debug, Clone)]
pub struct NetworkTransport {
    client: Client,
    ssdp_target: SocketAddr,
    discovery_timeout: Duration,
}

impl NetworkTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(UA)
            .connect_timeout(UPNP_HTTP_TIMEOUT)
            .read_timeout(UPNP_HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            ssdp_target: ssdp::SSDP_ADDR,
            discovery_timeout: DISCOVERY_TIMEOUT,
        })
    }

    /// Send M-SEARCH to `target` instead of the SSDP multicast group.
    pub fn with_ssdp_target(mut self, target: SocketAddr) -> Self {
        self.ssdp_target = target;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    async fn search(&self) -> Result<Option<String>> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| MonitorError::io("cannot open SSDP socket", e))?;

        socket
            .send_to(ssdp::search_request().as_bytes(), self.ssdp_target)
            .await
            .map_err(|e| MonitorError::io(format!("M-SEARCH to {} failed", self.ssdp_target), e))?;

        let mut buf = [0u8; 2048];
        match tokio::time::timeout(self.discovery_timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                info!("SSDP reply from {}", from);
                Ok(Some(String::from_utf8_lossy(&buf[..len]).into_owned()))
            }
            Ok(Err(e)) => Err(MonitorError::io("SSDP receive failed", e)),
            Err(_) => Ok(None),
        }
    }

    async fn get_descriptor(&self, location: &Url) -> Result<String> {
        let response = self
            .client
            .get(location.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    async fn soap(&self, control: &Url, action: &PortMappingAction) -> Result<SoapResponse> {
        let response = self
            .client
            .post(control.clone())
            .header(reqwest::header::CONTENT_TYPE, soap::CONTENT_TYPE)
            .header("SOAPAction", action.soap_action())
            .body(action.envelope())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        Ok(SoapResponse { status, body })
    }
}

impl UpnpTransport for NetworkTransport {
    fn discover(&self) -> BoxFuture<'_, Result<Option<String>>> {
        self.search().boxed()
    }

    fn fetch_descriptor<'a>(&'a self, location: &'a Url) -> BoxFuture<'a, Result<String>> {
        self.get_descriptor(location).boxed()
    }

    fn post_soap<'a>(
        &'a self,
        control: &'a Url,
        action: &'a PortMappingAction,
    ) -> BoxFuture<'a, Result<SoapResponse>> {
        self.soap(control, action).boxed()
    }
}

pub struct UpnpController<T = NetworkTransport> {
    transport: T,
    sink: Option<Arc<dyn MonitorSink>>,
}

impl UpnpController<NetworkTransport> {
    pub fn system() -> Result<Self> {
        Ok(Self::new(NetworkTransport::new()?))
    }
}

impl<T: UpnpTransport> UpnpController<T> {
    pub fn new(transport: T) -> Self {
        Self { transport, sink: None }
    }

    /// Mirror every transcript line to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn MonitorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn run(&self, action: &PortMappingAction) -> UpnpReport {
        let mut transcript = Transcript { lines: Vec::new(), sink: self.sink.as_deref() };
        transcript.push(format!("UPnP discovery started ({})", action.name()));

        let outcome = self.steps(action, &mut transcript).await;

        match &outcome {
            Ok(response) => info!("{} finished with HTTP {}", action.name(), response.status),
            Err(failure) => {
                warn!("{} failed: {}", action.name(), failure);
                transcript.push(failure.to_string());
            }
        }

        UpnpReport {
            action: action.name(),
            transcript: transcript.lines,
            outcome,
        }
    }

    async fn steps(
        &self,
        action: &PortMappingAction,
        transcript: &mut Transcript<'_>,
    ) -> std::result::Result<SoapResponse, UpnpFailure> {
        let reply = match self.transport.discover().await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Err(UpnpFailure::NoGateway),
            Err(e) => return Err(UpnpFailure::Discovery(e.message)),
        };
        transcript.push(format!("SSDP reply:\n{}", reply.trim_end()));

        let location = ssdp::location(&reply).ok_or(UpnpFailure::MissingLocation)?;
        let location = Url::parse(location)
            .map_err(|e| UpnpFailure::Descriptor(format!("bad LOCATION '{}': {}", location, e)))?;
        transcript.push(format!("Fetching device descriptor: {}", location));

        let xml = self
            .transport
            .fetch_descriptor(&location)
            .await
            .map_err(|e| UpnpFailure::Descriptor(e.message))?;

        let control = descriptor::control_url(&xml)
            .map_err(|e| UpnpFailure::Descriptor(format!("malformed descriptor: {}", e)))?
            .ok_or(UpnpFailure::NoWanIpService)?;
        let control = location
            .join(&control)
            .map_err(|e| UpnpFailure::InvalidControlUrl(format!("'{}': {}", control, e)))?;
        transcript.push(format!("Control URL: {}", control));

        let response = self
            .transport
            .post_soap(&control, action)
            .await
            .map_err(|e| UpnpFailure::Soap(e.message))?;

        transcript.push(format!("{} HTTP status: {}", action.name(), response.status.as_u16()));
        transcript.push(format!("Response:\n{}", response.body));

        if response.status.is_success() {
            Ok(response)
        } else {
            Err(UpnpFailure::Rejected(response))
        }
    }
}

struct Transcript<'a> {
    lines: Vec<String>,
    sink: Option<&'a dyn MonitorSink>,
}

impl Transcript<'_> {
    fn push(&mut self, line: String) {
        if let Some(sink) = self.sink {
            sink.on_log_line(&line);
        }
        self.lines.push(line);
    }
}
