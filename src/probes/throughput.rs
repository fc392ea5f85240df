//! Timed bulk transfers over HTTP.
//!
//! Both directions are lenient: any failure is logged and
//! reported as 0.0 Mbps so that the periodic scheduler keeps going.

use crate::errors::{MonitorError, Result};
use crate::measurements::calculate_mbps;
use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;

/// Bytes moved and the time it took.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transfer {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Transfer {
    pub fn mbps(&self) -> f64 {
        calculate_mbps(self.bytes, self.elapsed)
    }
}

#[derive(Debug, Clone)]
pub struct ThroughputProbe {
    client: Client,
}

impl ThroughputProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Stream `url` until `budget` bytes or end-of-stream, in Mbps.
    pub async fn download(&self, url: &str, budget: u64) -> f64 {
        info!("Download test: {} ({} bytes)", url, budget);

        match self.measure_download(url, budget).await {
            Ok(transfer) if transfer.bytes > 0 => {
                let mbps = transfer.mbps();
                info!(
                    "Download: {:.2} Mbps ({:.2} Mbit, {:.2} s)",
                    mbps,
                    transfer.bytes as f64 * 8.0 / 1_000_000.0,
                    transfer.elapsed.as_secs_f64()
                );
                mbps
            }
            Ok(_) => {
                warn!("Download test: no data received");
                0.0
            }
            Err(e) => {
                warn!("Download test failed: {}", e);
                0.0
            }
        }
    }

    /// POST an `bytes`-sized payload to `url`, in Mbps.
    pub async fn upload(&self, url: &str, bytes: u64) -> f64 {
        info!("Upload test: {} ({} bytes)", url, bytes);

        match self.measure_upload(url, bytes).await {
            Ok(transfer) => {
                let mbps = transfer.mbps();
                info!(
                    "Upload: {:.2} Mbps ({:.2} Mbit, {:.2} s)",
                    mbps,
                    transfer.bytes as f64 * 8.0 / 1_000_000.0,
                    transfer.elapsed.as_secs_f64()
                );
                mbps
            }
            Err(e) => {
                warn!("Upload test failed: {}", e);
                0.0
            }
        }
    }

    pub async fn measure_download(&self, url: &str, budget: u64) -> Result<Transfer> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;

        let mut total: u64 = 0;
        let start = Instant::now();

        while total < budget {
            match response.chunk().await? {
                Some(chunk) => {
                    total += (chunk.len() as u64).min(budget - total);
                }
                None => {
                    debug!("Download stream ended after {} bytes", total);
                    break;
                }
            }
        }

        Ok(Transfer { bytes: total, elapsed: start.elapsed() })
    }

    pub async fn measure_upload(&self, url: &str, bytes: u64) -> Result<Transfer> {
        if bytes == 0 {
            return Err(MonitorError::config("upload payload must not be empty"));
        }

        let payload = vec![b'A'; bytes as usize];

        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?
            .error_for_status()?;
        let elapsed = start.elapsed();

        debug!("Upload accepted with status {}", response.status());

        Ok(Transfer { bytes, elapsed })
    }
}
