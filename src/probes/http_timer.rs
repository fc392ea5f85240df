use crate::errors::Result;
use log::{info, warn};
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;

/// Times how long a server takes to answer with its status line.
#[derive(Debug, Clone)]
pub struct HttpTimer {
    client: Client,
}

impl HttpTimer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Response time in milliseconds, or 0.0 when the request failed.
    pub async fn time(&self, url: &str) -> f64 {
        info!("HTTP response time: {}", url);

        match self.measure(url).await {
            Ok(elapsed) => {
                let ms = elapsed.as_secs_f64() * 1000.0;
                info!("HTTP response time: {:.2} ms", ms);
                ms
            }
            Err(e) => {
                warn!("HTTP response time failed: {}", e);
                0.0
            }
        }
    }

    /// Time from request start until the status and headers are in.
    ///
    /// Any status counts as an answer; the body is never read.
    pub async fn measure(&self, url: &str) -> Result<Duration> {
        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let elapsed = start.elapsed();

        drop(response);

        Ok(elapsed)
    }
}
