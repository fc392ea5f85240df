//! Event types and the callback interface consumed by presentation,
//! logging and persistence collaborators.

use crate::measurements::Measurement;
use crate::packet::PacketTestMode;
use log::info;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted by the scheduler, the packet loops and one-shot tools.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A scheduler tick completed
    Measurement(Measurement),
    /// A packet-test loop produced a sample
    PacketSample {
        /// Mode that produced the sample
        mode: PacketTestMode,
        /// Sample in milliseconds (zero when nothing came back)
        value_ms: f64,
    },
    /// Free-form transcript line
    LogLine(String),
}

/// Callback interface for monitor output.
///
/// Implementations must be non-blocking; they are called from the
/// measuring tasks.
pub trait MonitorSink: Send + Sync {
    fn on_measurement(&self, measurement: &Measurement);

    fn on_packet_sample(&self, mode: PacketTestMode, value_ms: f64);

    fn on_log_line(&self, line: &str);
}

impl<S: MonitorSink + ?Sized> MonitorSink for Arc<S> {
    fn on_measurement(&self, measurement: &Measurement) {
        (**self).on_measurement(measurement)
    }

    fn on_packet_sample(&self, mode: PacketTestMode, value_ms: f64) {
        (**self).on_packet_sample(mode, value_ms)
    }

    fn on_log_line(&self, line: &str) {
        (**self).on_log_line(line)
    }
}

/// Forwards every event over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: MonitorEvent) {
        // A dropped receiver only means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}

impl MonitorSink for ChannelSink {
    fn on_measurement(&self, measurement: &Measurement) {
        self.send(MonitorEvent::Measurement(measurement.clone()));
    }

    fn on_packet_sample(&self, mode: PacketTestMode, value_ms: f64) {
        self.send(MonitorEvent::PacketSample { mode, value_ms });
    }

    fn on_log_line(&self, line: &str) {
        self.send(MonitorEvent::LogLine(line.to_string()));
    }
}

/// Writes every event through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MonitorSink for LogSink {
    fn on_measurement(&self, m: &Measurement) {
        info!(
            "[{}] download={:.2} Mbps upload={:.2} Mbps ping={:.2} ms jitter={:.2} ms loss={:.2} % http={:.2} ms",
            m.interface,
            m.download_mbps,
            m.upload_mbps,
            m.ping_avg_ms,
            m.jitter_ms,
            m.packet_loss_percent,
            m.http_response_ms
        );
    }

    fn on_packet_sample(&self, mode: PacketTestMode, value_ms: f64) {
        info!("[{}] sample {:.2} ms", mode, value_ms);
    }

    fn on_log_line(&self, line: &str) {
        info!("{}", line);
    }
}

/// Broadcasts each event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MonitorSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MonitorSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MonitorSink for FanoutSink {
    fn on_measurement(&self, measurement: &Measurement) {
        for sink in &self.sinks {
            sink.on_measurement(measurement);
        }
    }

    fn on_packet_sample(&self, mode: PacketTestMode, value_ms: f64) {
        for sink in &self.sinks {
            sink.on_packet_sample(mode, value_ms);
        }
    }

    fn on_log_line(&self, line: &str) {
        for sink in &self.sinks {
            sink.on_log_line(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();

        sink.on_packet_sample(PacketTestMode::Broadcast, 15.0);
        sink.on_log_line("hello");

        match rx.try_recv().unwrap() {
            MonitorEvent::PacketSample { mode, value_ms } => {
                assert_eq!(mode, PacketTestMode::Broadcast);
                assert_eq!(value_ms, 15.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), MonitorEvent::LogLine(l) if l == "hello"));
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_log_line("nobody listens");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let fanout = FanoutSink::new().with(Arc::new(a)).with(Arc::new(b));

        fanout.on_log_line("line");

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
