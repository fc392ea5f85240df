//! Continuous packet tests for the four IP delivery modes.
//!
//! Every mode owns one slot holding at most one running loop. A slot
//! transition (stop, start, or the stop-then-start of a restart) happens
//! while the slot's lock is held, and a stopped loop is awaited before the
//! lock is released, so its sockets are closed before a successor opens
//! its own. Anycast targets share the single anycast slot.

use crate::config::PACKET_SERIES_CAPACITY;
use crate::errors::Result;
use crate::measurements::{LatencySample, SharedSeries};
use crate::probes::ProbeSet;
use crate::sink::MonitorSink;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub mod anycast;
pub mod broadcast;
pub mod multicast;
pub mod unicast;

pub use anycast::{combine, AnycastTarget};
pub use broadcast::BroadcastTarget;
pub use multicast::MulticastTarget;
pub use unicast::UnicastTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketTestMode {
    Unicast,
    Broadcast,
    Multicast,
    Anycast,
}

impl PacketTestMode {
    pub const ALL: [PacketTestMode; 4] = [
        PacketTestMode::Unicast,
        PacketTestMode::Broadcast,
        PacketTestMode::Multicast,
        PacketTestMode::Anycast,
    ];

    fn index(self) -> usize {
        match self {
            PacketTestMode::Unicast => 0,
            PacketTestMode::Broadcast => 1,
            PacketTestMode::Multicast => 2,
            PacketTestMode::Anycast => 3,
        }
    }
}

impl fmt::Display for PacketTestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketTestMode::Unicast => "unicast",
            PacketTestMode::Broadcast => "broadcast",
            PacketTestMode::Multicast => "multicast",
            PacketTestMode::Anycast => "anycast",
        };
        f.write_str(name)
    }
}

/// What a loop probes; the variant decides the mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketTarget {
    Unicast(UnicastTarget),
    Broadcast(BroadcastTarget),
    Multicast(MulticastTarget),
    Anycast(AnycastTarget),
}

impl PacketTarget {
    pub fn mode(&self) -> PacketTestMode {
        match self {
            PacketTarget::Unicast(_) => PacketTestMode::Unicast,
            PacketTarget::Broadcast(_) => PacketTestMode::Broadcast,
            PacketTarget::Multicast(_) => PacketTestMode::Multicast,
            PacketTarget::Anycast(_) => PacketTestMode::Anycast,
        }
    }
}

impl fmt::Display for PacketTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketTarget::Unicast(t) => write!(f, "{}:{}", t.host, t.port),
            PacketTarget::Broadcast(t) => write!(f, "{}", t.destination),
            PacketTarget::Multicast(t) => write!(f, "{}:{}", t.group, t.port),
            PacketTarget::Anycast(t) => write!(f, "{} ({})", t.name, t.host),
        }
    }
}

/// One sample per call; the loop sleeps [`pause`](Self::pause) in between.
pub(crate) trait PacketProbe: Send + Sync + 'static {
    fn pause(&self) -> Duration;

    /// Representative latency in ms, zero when nothing answered.
    fn sample(&self) -> BoxFuture<'_, Result<f64>>;
}

struct LoopContext {
    mode: PacketTestMode,
    sink: Arc<dyn MonitorSink>,
    series: SharedSeries,
}

impl LoopContext {
    fn record(&self, value_ms: f64) {
        debug!("{} sample: {:.2} ms", self.mode, value_ms);
        self.series.push(value_ms);
        self.sink.on_packet_sample(self.mode, value_ms);
    }
}

async fn run_loop<P: PacketProbe>(probe: P, ctx: LoopContext, cancel: CancellationToken) {
    loop {
        // Dropping an unfinished sample future closes its socket
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = probe.sample() => outcome,
        };

        match outcome {
            Ok(value_ms) => ctx.record(value_ms),
            Err(e) => {
                warn!("{} test iteration failed: {}", ctx.mode, e);
                ctx.sink
                    .on_log_line(&format!("{} test error: {}", ctx.mode, e.message));
                ctx.record(0.0);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(probe.pause()) => {}
        }
    }

    debug!("{} loop exited", ctx.mode);
}

/// Receive until `silence` passes without a datagram and return the
/// smallest round trip measured from `sent_at`. Datagrams equal to
/// `ignore` are our own request looped back and do not count.
pub(crate) async fn drain_replies(
    socket: &UdpSocket,
    sent_at: Instant,
    silence: Duration,
    ignore: Option<&[u8]>,
) -> Option<Duration> {
    let mut buf = [0u8; 1500];
    let mut fastest: Option<Duration> = None;

    loop {
        match tokio::time::timeout(silence, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if ignore.is_some_and(|own| &buf[..len] == own) {
                    debug!("Ignoring own datagram from {}", from);
                    continue;
                }
                let rtt = sent_at.elapsed();
                debug!("Reply from {} ({} bytes) after {:?}", from, len, rtt);
                fastest = Some(fastest.map_or(rtt, |best| best.min(rtt)));
            }
            Ok(Err(e)) => {
                debug!("Receive failed: {}", e);
                break;
            }
            Err(_) => break,
        }
    }

    fastest
}

pub(crate) fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

struct RunningLoop {
    target: PacketTarget,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningLoop {
    async fn finish(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("{} loop ended abnormally: {}", self.target.mode(), e);
        }
    }
}

pub struct PacketTestEngine {
    probes: ProbeSet,
    sink: Arc<dyn MonitorSink>,
    slots: [Mutex<Option<RunningLoop>>; 4],
    series: [SharedSeries; 4],
}

impl PacketTestEngine {
    pub fn new(probes: ProbeSet, sink: Arc<dyn MonitorSink>) -> Self {
        Self {
            probes,
            sink,
            slots: Default::default(),
            series: std::array::from_fn(|_| SharedSeries::new(PACKET_SERIES_CAPACITY)),
        }
    }

    /// Start a loop for `target`, replacing whatever loop its mode runs.
    pub async fn start(&self, target: PacketTarget) {
        let mut slot = self.slots[target.mode().index()].lock().await;

        if let Some(previous) = slot.take() {
            info!("Restarting {} test", previous.target.mode());
            previous.finish().await;
        }

        *slot = Some(self.spawn(target));
    }

    /// Stop the loop of `mode`. Returns whether one was running.
    pub async fn stop(&self, mode: PacketTestMode) -> bool {
        let previous = self.slots[mode.index()].lock().await.take();

        match previous {
            Some(running) => {
                let target = running.target.clone();
                running.finish().await;
                info!("{} test stopped ({})", mode, target);
                self.sink
                    .on_log_line(&format!("{} test stopped ({})", mode, target));
                true
            }
            None => false,
        }
    }

    /// Start the loop when stopped, stop it when running. An anycast
    /// toggle naming a different target than the active one switches
    /// targets instead of stopping.
    ///
    /// Returns whether a loop for the mode runs afterwards.
    pub async fn toggle(&self, target: PacketTarget) -> bool {
        let mode = target.mode();
        let mut slot = self.slots[mode.index()].lock().await;

        if let Some(running) = slot.take() {
            let same_target = running.target == target;
            let previous = running.target.clone();
            running.finish().await;
            self.sink
                .on_log_line(&format!("{} test stopped ({})", mode, previous));

            if mode != PacketTestMode::Anycast || same_target {
                info!("{} test stopped ({})", mode, previous);
                return false;
            }
            info!("Switching anycast target from {} to {}", previous, target);
        }

        *slot = Some(self.spawn(target));
        true
    }

    pub async fn stop_all(&self) {
        for mode in PacketTestMode::ALL {
            self.stop(mode).await;
        }
    }

    pub async fn is_running(&self, mode: PacketTestMode) -> bool {
        self.slots[mode.index()]
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Target of the running anycast loop, if any.
    pub async fn active_anycast(&self) -> Option<AnycastTarget> {
        match self.slots[PacketTestMode::Anycast.index()].lock().await.as_ref() {
            Some(RunningLoop { target: PacketTarget::Anycast(target), .. }) => {
                Some(target.clone())
            }
            _ => None,
        }
    }

    pub fn series(&self, mode: PacketTestMode) -> Vec<f64> {
        self.series[mode.index()].snapshot()
    }

    /// One-shot ICMP ping, independent of the unicast loop. The result
    /// lands in the unicast series, zero when nothing answered.
    pub async fn ping_once(&self, host: &str) -> LatencySample {
        let sample = self.probes.latency.probe(host).await;
        self.sink.on_log_line(&format!("Ping {}: {}", host, sample));

        let mode = PacketTestMode::Unicast;
        let value_ms = sample.chart_value();
        self.series[mode.index()].push(value_ms);
        self.sink.on_packet_sample(mode, value_ms);
        sample
    }

    fn spawn(&self, target: PacketTarget) -> RunningLoop {
        let mode = target.mode();
        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            mode,
            sink: self.sink.clone(),
            series: self.series[mode.index()].clone(),
        };

        info!("{} test started ({})", mode, target);
        self.sink
            .on_log_line(&format!("{} test started ({})", mode, target));

        let handle = match &target {
            PacketTarget::Unicast(t) => {
                tokio::spawn(run_loop(t.clone(), ctx, cancel.clone()))
            }
            PacketTarget::Broadcast(t) => {
                tokio::spawn(run_loop(*t, ctx, cancel.clone()))
            }
            PacketTarget::Multicast(t) => {
                tokio::spawn(run_loop(*t, ctx, cancel.clone()))
            }
            PacketTarget::Anycast(t) => tokio::spawn(run_loop(
                anycast::AnycastProbe::new(t.clone(), &self.probes),
                ctx,
                cancel.clone(),
            )),
        };

        RunningLoop { target, cancel, handle }
    }
}

impl Drop for PacketTestEngine {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(running) = slot.get_mut().take() {
                running.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::LatencySample;
    use crate::probes::{http_client, LatencyProvider};
    use crate::sink::{ChannelSink, MonitorEvent};
    use futures::FutureExt;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FixedLatency(f64);

    impl LatencyProvider for FixedLatency {
        fn probe<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, LatencySample> {
            let ms = self.0;
            async move { LatencySample::from_ms(ms) }.boxed()
        }
    }

    fn engine() -> (PacketTestEngine, UnboundedReceiver<MonitorEvent>) {
        let (sink, rx) = ChannelSink::new();
        let probes = ProbeSet::new(Arc::new(FixedLatency(20.0)), http_client().unwrap());
        (PacketTestEngine::new(probes, Arc::new(sink)), rx)
    }

    fn unreachable_anycast(name: &str) -> PacketTarget {
        PacketTarget::Anycast(AnycastTarget {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            trace_url: "http://127.0.0.1:1/cdn-cgi/trace".to_string(),
        })
    }

    async fn echo_responder() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    async fn next_sample(
        rx: &mut UnboundedReceiver<MonitorEvent>,
        wanted: PacketTestMode,
    ) -> f64 {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(MonitorEvent::PacketSample { mode, value_ms }) if mode == wanted => {
                        return value_ms
                    }
                    Some(_) => continue,
                    None => panic!("sink closed"),
                }
            }
        })
        .await
        .expect("no packet sample")
    }

    #[tokio::test]
    async fn test_drain_replies_keeps_fastest() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let sent_at = Instant::now();
        for delay_ms in [40u64, 15, 60] {
            let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                responder.send_to(b"pong", client_addr).await.unwrap();
            });
        }

        let fastest = drain_replies(&client, sent_at, Duration::from_millis(300), None)
            .await
            .unwrap();

        assert!(fastest >= Duration::from_millis(15));
        assert!(fastest < Duration::from_millis(40), "got {:?}", fastest);
    }

    #[tokio::test]
    async fn test_drain_replies_skips_own_request() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let sent_at = Instant::now();
        peer.send_to(b"REQUEST", client_addr).await.unwrap();
        let fastest = drain_replies(
            &client,
            sent_at,
            Duration::from_millis(100),
            Some(b"REQUEST".as_slice()),
        )
        .await;
        assert_eq!(fastest, None);

        peer.send_to(b"REQUEST", client_addr).await.unwrap();
        peer.send_to(b"REPLY", client_addr).await.unwrap();
        let fastest = drain_replies(
            &client,
            Instant::now(),
            Duration::from_millis(100),
            Some(b"REQUEST".as_slice()),
        )
        .await;
        assert!(fastest.is_some());
    }

    #[tokio::test]
    async fn test_drain_replies_silence_is_none() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fastest =
            drain_replies(&client, Instant::now(), Duration::from_millis(50), None).await;
        assert_eq!(fastest, None);
    }

    #[tokio::test]
    async fn test_toggle_unicast_records_echo() {
        let (responder, port) = echo_responder().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((len, from)) = responder.recv_from(&mut buf).await {
                let _ = responder.send_to(&buf[..len], from).await;
            }
        });

        let (engine, mut rx) = engine();
        let target = PacketTarget::Unicast(UnicastTarget::new("127.0.0.1", port));

        assert!(engine.toggle(target.clone()).await);
        assert!(engine.is_running(PacketTestMode::Unicast).await);

        let value = next_sample(&mut rx, PacketTestMode::Unicast).await;
        assert!(value > 0.0 && value < 1000.0);

        assert!(!engine.toggle(target).await);
        assert!(!engine.is_running(PacketTestMode::Unicast).await);
        assert!(!engine.series(PacketTestMode::Unicast).is_empty());
    }

    #[tokio::test]
    async fn test_unicast_timeout_records_zero() {
        // Bound but silent, so no ICMP unreachable comes back either
        let (_silent, port) = echo_responder().await;

        let (engine, mut rx) = engine();
        engine
            .start(PacketTarget::Unicast(UnicastTarget::new("127.0.0.1", port)))
            .await;

        assert_eq!(next_sample(&mut rx, PacketTestMode::Unicast).await, 0.0);
        engine.stop_all().await;
    }

    #[tokio::test]
    async fn test_broadcast_loop_uses_fastest_reply() {
        let (responder, port) = echo_responder().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((_, from)) = responder.recv_from(&mut buf).await {
                let _ = responder.send_to(b"here", from).await;
            }
        });

        let (engine, mut rx) = engine();
        let target = BroadcastTarget {
            destination: std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        };
        engine.start(PacketTarget::Broadcast(target)).await;

        let value = next_sample(&mut rx, PacketTestMode::Broadcast).await;
        assert!(value > 0.0 && value < 1000.0);

        assert!(engine.stop(PacketTestMode::Broadcast).await);
    }

    #[tokio::test]
    async fn test_restart_leaves_exactly_one_loop() {
        let (_silent, port) = echo_responder().await;
        let (engine, _rx) = engine();
        let target = PacketTarget::Unicast(UnicastTarget::new("127.0.0.1", port));

        engine.start(target.clone()).await;
        let first_cancel = engine.slots[0].lock().await.as_ref().unwrap().cancel.clone();

        engine.start(target).await;

        assert!(first_cancel.is_cancelled());
        let slot = engine.slots[0].lock().await;
        let current = slot.as_ref().unwrap();
        assert!(!current.cancel.is_cancelled());
        assert!(!current.handle.is_finished());
        drop(slot);

        engine.stop_all().await;
    }

    #[tokio::test]
    async fn test_modes_are_independent() {
        let (_silent, port) = echo_responder().await;
        let (engine, _rx) = engine();

        engine
            .start(PacketTarget::Unicast(UnicastTarget::new("127.0.0.1", port)))
            .await;
        engine.start(unreachable_anycast("A")).await;

        assert!(engine.stop(PacketTestMode::Anycast).await);
        assert!(engine.is_running(PacketTestMode::Unicast).await);
        assert!(!engine.is_running(PacketTestMode::Broadcast).await);

        engine.stop_all().await;
        assert!(!engine.is_running(PacketTestMode::Unicast).await);
    }

    #[tokio::test]
    async fn test_anycast_single_slot_switches_target() {
        let (engine, mut rx) = engine();

        assert!(engine.toggle(unreachable_anycast("A")).await);
        assert!(engine.toggle(unreachable_anycast("B")).await);

        let active = engine.active_anycast().await.unwrap();
        assert_eq!(active.name, "B");

        // Ping answered, HTTP refused: the ping value is the sample
        let sample = next_sample(&mut rx, PacketTestMode::Anycast).await;
        assert!((sample - 20.0).abs() < 1e-9);

        assert!(!engine.toggle(unreachable_anycast("B")).await);
        assert_eq!(engine.active_anycast().await, None);
    }

    #[tokio::test]
    async fn test_stop_is_prompt() {
        let (engine, mut rx) = engine();
        engine.start(unreachable_anycast("A")).await;
        next_sample(&mut rx, PacketTestMode::Anycast).await;

        let begin = Instant::now();
        assert!(engine.stop(PacketTestMode::Anycast).await);
        assert!(begin.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_unicast_closed_port_records_zero() {
        let port = {
            let (closed, port) = echo_responder().await;
            drop(closed);
            port
        };

        let (engine, mut rx) = engine();
        engine
            .start(PacketTarget::Unicast(UnicastTarget::new("127.0.0.1", port)))
            .await;

        // Either the ICMP refusal or the reply timeout yields zero
        assert_eq!(next_sample(&mut rx, PacketTestMode::Unicast).await, 0.0);
        engine.stop_all().await;
        assert!(engine.series(PacketTestMode::Unicast).iter().all(|v| *v == 0.0));
        assert!(!engine.series(PacketTestMode::Unicast).is_empty());
    }

    #[tokio::test]
    async fn test_ping_once_feeds_unicast_series() {
        let (engine, mut rx) = engine();
        assert_eq!(
            engine.ping_once("192.0.2.1").await,
            LatencySample::from_ms(20.0)
        );

        let series = engine.series(PacketTestMode::Unicast);
        assert_eq!(series.len(), 1);
        assert!((series[0] - 20.0).abs() < 1e-9);
        assert!(!engine.is_running(PacketTestMode::Unicast).await);

        let sample = next_sample(&mut rx, PacketTestMode::Unicast).await;
        assert!((sample - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_mode_display() {
        let names: Vec<String> =
            PacketTestMode::ALL.iter().map(|m| m.to_string()).collect();
        assert_eq!(names, ["unicast", "broadcast", "multicast", "anycast"]);
    }
}
