//! Runtime settings read by the monitor scheduler.
//!
//! Settings are shared process-wide behind [`SettingsHandle`]. The
//! scheduler takes a [`Settings`] snapshot at the start of each tick, so
//! a change applied mid-tick only shows up in the next measurement.

use crate::errors::{MonitorError, Result};
use log::info;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

/// Connect timeout for HTTP probes.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Read timeout for HTTP probes.
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(8);

/// Connect/read timeout for UPnP descriptor and SOAP requests.
pub const UPNP_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between consecutive pings of one statistics batch.
pub const INTER_PROBE_DELAY: Duration = Duration::from_millis(200);

/// Capacity of the download/upload/ping chart series.
pub const MONITOR_SERIES_CAPACITY: usize = 240;

/// Capacity of each packet-test chart series.
pub const PACKET_SERIES_CAPACITY: usize = 100;

const MIN_PING_COUNT: u32 = 1;
const MAX_PING_COUNT: u32 = 50;
const MIN_DOWNLOAD_BYTES: u64 = 64 * 1024;
const MAX_DOWNLOAD_BYTES: u64 = 50 * 1024 * 1024;
const MIN_UPLOAD_BYTES: u64 = 64 * 1024;
const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Measurement settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Host pinged for latency statistics.
    /// Default: 8.8.8.8
    pub ping_target: String,

    /// Number of pings per statistics batch.
    /// Default: 5
    pub ping_count: u32,

    /// URL streamed for the download measurement.
    pub speed_test_url: String,

    /// Endpoint receiving the upload measurement POST.
    pub upload_url: String,

    /// Byte budget of the download measurement.
    /// Default: 2 MiB
    pub download_bytes: u64,

    /// Size of the upload payload.
    /// Default: 512 KiB
    pub upload_bytes: u64,

    /// URL whose status line is timed.
    pub http_test_url: String,
}

impl Settings {
    pub const DEFAULT_PING_TARGET: &'static str = "8.8.8.8";
    pub const DEFAULT_PING_COUNT: u32 = 5;
    pub const DEFAULT_SPEED_TEST_URL: &'static str =
        "https://speed.hetzner.de/10MB.bin";
    pub const DEFAULT_UPLOAD_URL: &'static str = "https://httpbin.org/post";
    pub const DEFAULT_DOWNLOAD_BYTES: u64 = 2 * 1024 * 1024;
    pub const DEFAULT_UPLOAD_BYTES: u64 = 512 * 1024;
    pub const DEFAULT_HTTP_TEST_URL: &'static str = "https://www.google.com";

    /// Check that every field is within its accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.ping_target.trim().is_empty() {
            return Err(MonitorError::config("ping target must not be empty"));
        }

        if !(MIN_PING_COUNT..=MAX_PING_COUNT).contains(&self.ping_count) {
            return Err(MonitorError::config(format!(
                "ping count must be between {} and {}, got {}",
                MIN_PING_COUNT, MAX_PING_COUNT, self.ping_count
            )));
        }

        if !(MIN_DOWNLOAD_BYTES..=MAX_DOWNLOAD_BYTES)
            .contains(&self.download_bytes)
        {
            return Err(MonitorError::config(format!(
                "download budget must be between {} and {} bytes, got {}",
                MIN_DOWNLOAD_BYTES, MAX_DOWNLOAD_BYTES, self.download_bytes
            )));
        }

        if !(MIN_UPLOAD_BYTES..=MAX_UPLOAD_BYTES).contains(&self.upload_bytes) {
            return Err(MonitorError::config(format!(
                "upload budget must be between {} and {} bytes, got {}",
                MIN_UPLOAD_BYTES, MAX_UPLOAD_BYTES, self.upload_bytes
            )));
        }

        for (name, value) in [
            ("speed test URL", &self.speed_test_url),
            ("upload URL", &self.upload_url),
            ("HTTP test URL", &self.http_test_url),
        ] {
            Url::parse(value).map_err(|e| {
                MonitorError::config(format!("invalid {} '{}': {}", name, value, e))
            })?;
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_target: Self::DEFAULT_PING_TARGET.to_string(),
            ping_count: Self::DEFAULT_PING_COUNT,
            speed_test_url: Self::DEFAULT_SPEED_TEST_URL.to_string(),
            upload_url: Self::DEFAULT_UPLOAD_URL.to_string(),
            download_bytes: Self::DEFAULT_DOWNLOAD_BYTES,
            upload_bytes: Self::DEFAULT_UPLOAD_BYTES,
            http_test_url: Self::DEFAULT_HTTP_TEST_URL.to_string(),
        }
    }
}

/// Shared, lock-guarded settings.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self { inner: Arc::new(RwLock::new(settings)) }
    }

    /// Immutable copy of the current settings.
    pub fn snapshot(&self) -> Settings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate and replace the settings; takes effect on the next tick.
    pub fn apply(&self, settings: Settings) -> Result<()> {
        settings.validate()?;

        info!("Settings updated:");
        info!(
            "  ping target: {}, count: {}",
            settings.ping_target, settings.ping_count
        );
        info!("  download URL: {}", settings.speed_test_url);
        info!("  download budget: {} bytes", settings.download_bytes);
        info!("  upload budget: {} bytes", settings.upload_bytes);
        info!("  HTTP test URL: {}", settings.http_test_url);

        match self.inner.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }

        Ok(())
    }
}
