//! Per-channel traffic counters and latency tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters a channel maintains about its own traffic.
///
/// The mean send latency feeds the channel-selection tie-break: among
/// equally-preferred connected channels, the one with the lowest observed
/// mean wins.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    send_failures: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl ChannelMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful send and its wall-clock duration.
    pub fn record_send(&self, elapsed: Duration) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.latency_sum_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed send.
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a received message.
    pub fn record_receive(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean send latency over the channel's lifetime, if any sends happened.
    #[must_use]
    pub fn mean_latency(&self) -> Option<Duration> {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return None;
        }
        let sum = self.latency_sum_us.load(Ordering::Relaxed);
        Some(Duration::from_micros(sum / samples))
    }

    /// Takes a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ChannelMetricsSnapshot {
        ChannelMetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            mean_latency: self.mean_latency(),
        }
    }
}

/// Point-in-time copy of [`ChannelMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMetricsSnapshot {
    /// Messages sent.
    pub sent: u64,
    /// Messages received.
    pub received: u64,
    /// Failed send attempts.
    pub send_failures: u64,
    /// Mean send latency, when at least one send completed.
    pub mean_latency: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metrics_have_no_latency() {
        let metrics = ChannelMetrics::new();
        assert_eq!(metrics.mean_latency(), None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent, 0);
        assert_eq!(snapshot.mean_latency, None);
    }

    #[test]
    fn mean_latency_averages_samples() {
        let metrics = ChannelMetrics::new();
        metrics.record_send(Duration::from_micros(100));
        metrics.record_send(Duration::from_micros(300));

        assert_eq!(metrics.mean_latency(), Some(Duration::from_micros(200)));
        assert_eq!(metrics.snapshot().sent, 2);
    }

    #[test]
    fn failures_counted_separately() {
        let metrics = ChannelMetrics::new();
        metrics.record_send_failure();
        metrics.record_receive();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.send_failures, 1);
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.sent, 0);
    }
}
