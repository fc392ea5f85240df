//! Periodic monitor: one measurement tick every interval.
//!
//! A tick runs the throughput probe, the ping statistics batch and the
//! HTTP timer one after another, assembles a [`Measurement`] and hands it
//! to the history, the chart series, the optional CSV log and the sink.
//! Ticks run in their own task so that a panicking probe only loses that
//! tick.

use crate::config::{SettingsHandle, INTER_PROBE_DELAY};
use crate::errors::{MonitorError, Result};
use crate::measurements::{Measurement, MeasurementHistory, MonitorSeries};
use crate::persistence::CsvLog;
use crate::probes::ProbeSet;
use crate::sink::MonitorSink;
use crate::stats::collect_ping_stats;
use chrono::Local;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Shortest accepted tick interval in seconds.
pub const MIN_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningTask {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

struct Inner {
    probes: ProbeSet,
    settings: SettingsHandle,
    history: MeasurementHistory,
    series: MonitorSeries,
    sink: Arc<dyn MonitorSink>,
    csv: Option<CsvLog>,
    // Scheduled and manual ticks never overlap
    tick_lock: tokio::sync::Mutex<()>,
}

pub struct MonitorScheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<RunningTask>>,
}

impl MonitorScheduler {
    pub fn new(
        probes: ProbeSet,
        settings: SettingsHandle,
        sink: Arc<dyn MonitorSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                probes,
                settings,
                history: MeasurementHistory::new(),
                series: MonitorSeries::default(),
                sink,
                csv: None,
                tick_lock: tokio::sync::Mutex::new(()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Append every measurement to `log` as well.
    ///
    /// Only meaningful before the first [`start`](Self::start).
    pub fn with_csv_log(mut self, log: CsvLog) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.csv = Some(log);
        } else {
            warn!("CSV log ignored: monitor already started");
        }
        self
    }

    pub fn history(&self) -> &MeasurementHistory {
        &self.inner.history
    }

    pub fn series(&self) -> &MonitorSeries {
        &self.inner.series
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.inner.settings
    }

    pub fn state(&self) -> SchedulerState {
        match self.slot().as_ref() {
            Some(task) if task.is_active() => SchedulerState::Running,
            _ => SchedulerState::Idle,
        }
    }

    /// Begin ticking for `interface`: the first tick right away, then every
    /// `interval_secs` seconds (at least one).
    ///
    /// Fails while the monitor is already running; the running loop is left
    /// untouched.
    pub fn start(&self, interface: impl Into<String>, interval_secs: u64) -> Result<()> {
        let mut slot = self.slot();

        if slot.as_ref().is_some_and(RunningTask::is_active) {
            return Err(MonitorError::config("monitor is already running")
                .with_suggestion("Stop the running monitor before starting a new one"));
        }

        let interface = interface.into();
        let period = Duration::from_secs(interval_secs.max(MIN_INTERVAL_SECS));
        let cancel = CancellationToken::new();

        info!(
            "Monitor started on {} every {} s",
            interface,
            period.as_secs()
        );
        self.inner
            .sink
            .on_log_line(&format!("Monitor started ({}, every {} s)", interface, period.as_secs()));

        let handle = tokio::spawn(run(
            self.inner.clone(),
            interface,
            period,
            cancel.clone(),
        ));

        *slot = Some(RunningTask { cancel, handle });
        Ok(())
    }

    /// Stop scheduling ticks. A tick already in progress runs to completion.
    ///
    /// Returns whether a running loop was stopped.
    pub fn stop(&self) -> bool {
        match self.slot().take() {
            Some(task) => {
                let was_active = task.is_active();
                task.cancel.cancel();
                if was_active {
                    info!("Monitor stopped");
                    self.inner.sink.on_log_line("Monitor stopped");
                }
                was_active
            }
            None => false,
        }
    }

    /// Stop and wait for an in-flight tick to finish.
    pub async fn shutdown(&self) {
        let task = self.slot().take();

        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                debug!("Monitor loop ended abnormally: {}", e);
            }
            self.inner.sink.on_log_line("Monitor stopped");
        }
    }

    /// Run a single tick outside the periodic loop.
    pub async fn tick_once(&self, interface: &str) -> Measurement {
        self.inner.tick(interface).await
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<RunningTask>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for MonitorScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.slot().take() {
            task.cancel.cancel();
        }
    }
}

async fn run(
    inner: Arc<Inner>,
    interface: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tick_inner = inner.clone();
        let tick_interface = interface.clone();
        let tick = tokio::spawn(async move {
            tick_inner.tick(&tick_interface).await;
        });

        if let Err(e) = tick.await {
            if e.is_panic() {
                error!("Measurement tick failed: {}", e);
                inner
                    .sink
                    .on_log_line(&format!("Measurement failed: {}", e));
            }
        }
    }

    debug!("Monitor loop for {} exited", interface);
}

impl Inner {
    async fn tick(&self, interface: &str) -> Measurement {
        let _guard = self.tick_lock.lock().await;
        let settings = self.settings.snapshot();

        self.sink
            .on_log_line(&format!("Measurement started ({})", interface));

        let download_mbps = self
            .probes
            .throughput
            .download(&settings.speed_test_url, settings.download_bytes)
            .await;
        let upload_mbps = self
            .probes
            .throughput
            .upload(&settings.upload_url, settings.upload_bytes)
            .await;
        let ping = collect_ping_stats(
            &*self.probes.latency,
            &settings.ping_target,
            settings.ping_count,
            INTER_PROBE_DELAY,
        )
        .await;
        let http_response_ms = self.probes.http.time(&settings.http_test_url).await;

        let measurement = Measurement {
            timestamp: Local::now(),
            interface: interface.to_string(),
            download_mbps,
            upload_mbps,
            ping_avg_ms: ping.avg_ms,
            jitter_ms: ping.jitter_ms,
            packet_loss_percent: ping.loss_percent,
            http_response_ms,
        };

        self.history.push(measurement.clone());
        self.series.record(&measurement);

        if let Some(csv) = &self.csv {
            if let Err(e) = csv.append(&measurement) {
                warn!("CSV append failed: {}", e);
                self.sink.on_log_line(&format!("CSV write failed: {}", e));
            }
        }

        self.sink.on_log_line(&format!(
            "DL: {:.2} Mbps | UL: {:.2} Mbps | Ping: {:.2} ms | Jitter: {:.2} ms | Loss: {:.2} % | HTTP: {:.2} ms",
            measurement.download_mbps,
            measurement.upload_mbps,
            measurement.ping_avg_ms,
            measurement.jitter_ms,
            measurement.packet_loss_percent,
            measurement.http_response_ms
        ));
        self.sink.on_measurement(&measurement);

        measurement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::measurements::LatencySample;
    use crate::probes::{http_client, LatencyProvider, TcpConnectProbe};
    use crate::sink::{ChannelSink, MonitorEvent};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn unreachable_settings() -> Settings {
        Settings {
            ping_target: "127.0.0.1".to_string(),
            ping_count: 2,
            speed_test_url: "http://127.0.0.1:1/10MB.bin".to_string(),
            upload_url: "http://127.0.0.1:1/post".to_string(),
            http_test_url: "http://127.0.0.1:1/".to_string(),
            ..Settings::default()
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn scheduler(
        latency: Arc<dyn LatencyProvider>,
    ) -> (MonitorScheduler, UnboundedReceiver<MonitorEvent>) {
        let (sink, rx) = ChannelSink::new();
        let probes = ProbeSet::new(latency, http_client().unwrap());
        let settings = SettingsHandle::new(unreachable_settings());
        (MonitorScheduler::new(probes, settings, Arc::new(sink)), rx)
    }

    async fn next_measurement(rx: &mut UnboundedReceiver<MonitorEvent>) -> Measurement {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Some(MonitorEvent::Measurement(m)) => return m,
                    Some(_) => continue,
                    None => panic!("sink closed"),
                }
            }
        })
        .await
        .expect("no measurement emitted")
    }

    #[tokio::test]
    async fn test_unreachable_tick_emits_zeroed_measurement() {
        let port = closed_port().await;
        let (scheduler, mut rx) = scheduler(Arc::new(TcpConnectProbe::new(port)));

        scheduler.start("lo", 3600).unwrap();
        let m = next_measurement(&mut rx).await;

        assert_eq!(m.interface, "lo");
        assert_eq!(m.download_mbps, 0.0);
        assert_eq!(m.upload_mbps, 0.0);
        assert_eq!(m.ping_avg_ms, 0.0);
        assert_eq!(m.jitter_ms, 0.0);
        assert_eq!(m.packet_loss_percent, 100.0);
        assert_eq!(m.http_response_ms, 0.0);

        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(scheduler.history().len(), 1);
        assert_eq!(scheduler.series().ping.snapshot(), vec![0.0]);

        assert!(scheduler.stop());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let port = closed_port().await;
        let (scheduler, _rx) = scheduler(Arc::new(TcpConnectProbe::new(port)));

        scheduler.start("eth0", 3600).unwrap();
        let err = scheduler.start("eth1", 3600).unwrap_err();

        assert!(err.to_string().contains("already running"));
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        // Restart after a stop is allowed
        scheduler.start("eth1", 3600).unwrap();
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let port = closed_port().await;
        let (scheduler, _rx) = scheduler(Arc::new(TcpConnectProbe::new(port)));
        assert!(!scheduler.stop());
    }

    struct PanicOnce {
        calls: AtomicUsize,
    }

    impl LatencyProvider for PanicOnce {
        fn probe<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, LatencySample> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    panic!("probe blew up");
                }
                LatencySample::NoResponse
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_panicking_tick_does_not_stop_scheduler() {
        let provider = Arc::new(PanicOnce { calls: AtomicUsize::new(0) });
        let (scheduler, mut rx) = scheduler(provider);

        scheduler.start("wlan0", 1).unwrap();

        // The first tick panics; the one after it must still arrive
        let m = next_measurement(&mut rx).await;
        assert_eq!(m.packet_loss_percent, 100.0);
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(scheduler.history().len(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_tick_appends_csv_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network_log.csv");
        let port = closed_port().await;

        let (scheduler, _rx) = scheduler(Arc::new(TcpConnectProbe::new(port)));
        let scheduler = scheduler.with_csv_log(CsvLog::open(&path).unwrap());

        scheduler.tick_once("eth0").await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(";\"eth0\";0.00;0.00;0.00;0.00;100.00;0.00"));
    }

    #[tokio::test]
    async fn test_settings_change_applies_to_next_tick() {
        let port = closed_port().await;
        let (scheduler, _rx) = scheduler(Arc::new(TcpConnectProbe::new(port)));

        scheduler.tick_once("eth0").await;
        scheduler
            .settings()
            .apply(Settings { ping_count: 1, ..unreachable_settings() })
            .unwrap();
        let m = scheduler.tick_once("eth0").await;

        assert_eq!(m.packet_loss_percent, 100.0);
        assert_eq!(scheduler.history().len(), 2);
    }
}
