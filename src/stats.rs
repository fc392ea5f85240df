use crate::measurements::LatencySample;
use crate::probes::LatencyProvider;
use log::{debug, info};
use std::time::Duration;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation: `sqrt(mean((x - avg)^2))`.
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    let avg = mean(values)?;

    let variance = values
        .iter()
        .map(|value| (value - avg) * (value - avg))
        .sum::<f64>()
        / values.len() as f64;

    Some(variance.sqrt())
}

/// Smallest value of a batch, ignoring NaNs.
pub fn minimum(values: &[f64]) -> Option<f64> {
    values.iter().copied().filter(|v| !v.is_nan()).reduce(f64::min)
}

/// Average, jitter and loss derived from one batch of pings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PingStats {
    pub avg_ms: f64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
}

impl PingStats {
    /// Aggregate a batch of probe attempts.
    ///
    /// Failed attempts are excluded from the mean and jitter but counted
    /// toward loss. A batch without a single reply yields zero average and
    /// jitter with 100% loss. An empty batch reports no loss.
    pub fn aggregate(samples: &[LatencySample]) -> Self {
        let rtts: Vec<f64> = samples.iter().filter_map(|s| s.rtt_ms()).collect();
        let attempts = samples.len();

        let loss_percent = if attempts == 0 {
            0.0
        } else {
            100.0 * (attempts - rtts.len()) as f64 / attempts as f64
        };

        Self {
            avg_ms: mean(&rtts).unwrap_or(0.0),
            jitter_ms: population_std_dev(&rtts).unwrap_or(0.0),
            loss_percent,
        }
    }
}

/// Run `count` sequential probes against `host` and aggregate them.
///
/// Probes are never issued in parallel; `delay` separates consecutive
/// attempts.
pub async fn collect_ping_stats(
    provider: &dyn LatencyProvider,
    host: &str,
    count: u32,
    delay: Duration,
) -> PingStats {
    info!("Multi-ping: {} ({} probes)", host, count);

    let mut samples = Vec::with_capacity(count as usize);

    for i in 0..count {
        let sample = provider.probe(host).await;
        debug!("Ping {}/{} to {}: {}", i + 1, count, host, sample);
        samples.push(sample);

        if i + 1 < count {
            tokio::time::sleep(delay).await;
        }
    }

    let stats = PingStats::aggregate(&samples);

    info!(
        "Ping stats: avg={:.2} ms, jitter={:.2} ms, loss={:.2} %",
        stats.avg_ms, stats.jitter_ms, stats.loss_percent
    );

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn ok(ms: f64) -> LatencySample {
        LatencySample::Reply(Duration::from_secs_f64(ms / 1000.0))
    }

    #[test]
    fn test_mean_empty() {
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_population_std_dev_known_values() {
        // Mean 5, squared deviations sum to 32 over 8 values
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let sd = population_std_dev(&values).unwrap();
        assert!((sd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_minimum_picks_fastest_reply() {
        assert_eq!(minimum(&[40.0, 15.0, 60.0]), Some(15.0));
        assert_eq!(minimum(&[]), None);
    }

    #[test]
    fn test_aggregate_all_lost() {
        let samples = vec![LatencySample::NoResponse; 5];
        let stats = PingStats::aggregate(&samples);
        assert_eq!(stats.avg_ms, 0.0);
        assert_eq!(stats.jitter_ms, 0.0);
        assert_eq!(stats.loss_percent, 100.0);
    }

    #[test]
    fn test_aggregate_zero_rtt_is_not_loss() {
        let samples = vec![ok(0.0), ok(0.0), LatencySample::NoResponse];
        let stats = PingStats::aggregate(&samples);
        assert_eq!(stats.avg_ms, 0.0);
        assert!((stats.loss_percent - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_mixed() {
        let samples =
            vec![ok(10.0), LatencySample::NoResponse, ok(20.0), ok(30.0), LatencySample::NoResponse];
        let stats = PingStats::aggregate(&samples);
        assert!((stats.avg_ms - 20.0).abs() < 1e-9);
        assert!((stats.jitter_ms - (200.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!((stats.loss_percent - 40.0).abs() < 1e-9);
    }

    struct ScriptedProvider {
        replies: Mutex<Vec<LatencySample>>,
        hosts: Mutex<Vec<String>>,
    }

    impl LatencyProvider for ScriptedProvider {
        fn probe<'a>(&'a self, host: &'a str) -> BoxFuture<'a, LatencySample> {
            async move {
                self.hosts.lock().unwrap().push(host.to_string());
                self.replies.lock().unwrap().remove(0)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_ping_stats_runs_sequential_batch() {
        let provider = ScriptedProvider {
            replies: Mutex::new(vec![ok(10.0), LatencySample::NoResponse, ok(30.0)]),
            hosts: Mutex::new(Vec::new()),
        };

        let start = tokio::time::Instant::now();
        let stats = collect_ping_stats(
            &provider,
            "192.0.2.1",
            3,
            Duration::from_millis(200),
        )
        .await;

        // Two gaps between three probes
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(provider.hosts.lock().unwrap().len(), 3);
        assert!((stats.avg_ms - 20.0).abs() < 1e-9);
        assert!((stats.loss_percent - 100.0 / 3.0).abs() < 1e-9);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// loss% = 100 * (N - k) / N for every success count k
        #[test]
        fn loss_percent_matches_formula(
            rtts in prop::collection::vec(prop::option::of(0.0f64..1000.0), 1..50),
        ) {
            let samples: Vec<LatencySample> = rtts
                .iter()
                .map(|r| r.map(ok).unwrap_or(LatencySample::NoResponse))
                .collect();
            let n = samples.len();
            let k = rtts.iter().filter(|r| r.is_some()).count();

            let stats = PingStats::aggregate(&samples);
            let expected = 100.0 * (n - k) as f64 / n as f64;

            prop_assert!((stats.loss_percent - expected).abs() < 1e-9);
            if k == 0 {
                prop_assert_eq!(stats.loss_percent, 100.0);
            }
            if k == n {
                prop_assert_eq!(stats.loss_percent, 0.0);
            }
        }

        /// Jitter is never negative
        #[test]
        fn jitter_is_non_negative(
            values in prop::collection::vec(0.0f64..5000.0, 0..50),
        ) {
            let samples: Vec<LatencySample> = values.iter().copied().map(ok).collect();
            prop_assert!(PingStats::aggregate(&samples).jitter_ms >= 0.0);
        }

        /// Equal samples have zero jitter
        #[test]
        fn equal_samples_have_zero_jitter(
            value in 0.0f64..5000.0,
            count in 1usize..50,
        ) {
            let values = vec![value; count];
            let sd = population_std_dev(&values).unwrap();
            prop_assert!(sd.abs() < 1e-9);
        }
    }
}
