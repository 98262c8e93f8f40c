//! QoS statistics engine
//!
//! Buffers the packet events of one run by sequence number and turns them
//! into packet loss, latency and jitter aggregates once the run finishes.
//! Lost packets are penalized with the per-packet timeout so that a dead
//! target reads as maximally degraded instead of "zero latency".

use probe_common::constants::{MICROS_PER_MILLI, NANOS_PER_MICRO};
use probe_common::PacketEvent;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Transport-level counters for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PingStatistics {
    /// Echo requests sent
    pub packets_sent: usize,
    /// Distinct echo replies received
    pub packets_recv: usize,
    /// Replies received more than once
    pub packets_recv_duplicates: usize,
    /// Loss in percent of sent packets
    pub packet_loss: f64,
    /// Round-trip times of received packets, in sequence order
    pub rtts: Vec<Duration>,
    pub min_rtt: Duration,
    pub max_rtt: Duration,
    pub avg_rtt: Duration,
    /// Population standard deviation of `rtts`
    pub std_dev_rtt: Duration,
}

/// Aggregates of one QoS run
///
/// Latency values are milliseconds, jitter values are microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QosAggregate {
    /// Packets configured for the run
    pub packet_count: usize,
    pub packets_sent: usize,
    pub packets_received: usize,
    pub packets_lost: usize,
    pub loss_percentage: f64,
    pub latency_total_ms: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
    pub latency_avg_ms: f64,
    pub latency_std_dev_ms: f64,
    pub jitter_total_us: f64,
    pub jitter_max_us: f64,
    pub jitter_min_us: f64,
    pub jitter_mean_us: f64,
}

/// Collects packet events for one run
#[derive(Debug)]
pub struct QosCollector {
    /// Packets configured for the run
    packet_count: usize,
    /// Penalty applied per lost packet
    timeout: Duration,
    packets_sent: usize,
    received: BTreeMap<u16, Duration>,
    lost: BTreeSet<u16>,
    duplicates: usize,
}

impl QosCollector {
    /// Create a collector for a run of `packet_count` packets
    ///
    /// # Arguments
    ///
    /// * `packet_count` - Configured number of echo requests
    /// * `timeout` - Per-packet timeout, substituted for lost round-trips
    pub fn new(packet_count: usize, timeout: Duration) -> Self {
        Self {
            packet_count,
            timeout,
            packets_sent: 0,
            received: BTreeMap::new(),
            lost: BTreeSet::new(),
            duplicates: 0,
        }
    }

    /// Add a packet event
    ///
    /// Events may arrive in any order. Replies for a sequence already marked
    /// lost are ignored, and repeated replies are counted as duplicates.
    pub fn add_event(&mut self, event: &PacketEvent) {
        match *event {
            PacketEvent::Sent { .. } => self.packets_sent += 1,
            PacketEvent::Received { seq, rtt } => {
                if self.lost.contains(&seq) {
                    return;
                }
                match self.received.entry(seq) {
                    Entry::Occupied(_) => self.duplicates += 1,
                    Entry::Vacant(slot) => {
                        slot.insert(rtt);
                    }
                }
            }
            PacketEvent::Lost { seq } => {
                if !self.received.contains_key(&seq) {
                    self.lost.insert(seq);
                }
            }
        }
    }

    /// Transport counters derived from the recorded events
    pub fn statistics(&self) -> PingStatistics {
        let rtts: Vec<Duration> = self.received.values().copied().collect();
        let packets_recv = rtts.len();
        let packet_loss = if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_sent.saturating_sub(packets_recv) as f64 * 100.0 / self.packets_sent as f64
        };

        let mut stats = PingStatistics {
            packets_sent: self.packets_sent,
            packets_recv,
            packets_recv_duplicates: self.duplicates,
            packet_loss,
            ..Default::default()
        };
        if rtts.is_empty() {
            return stats;
        }

        let samples: Vec<f64> = rtts.iter().map(|rtt| rtt.as_nanos() as f64).collect();
        let total: Duration = rtts.iter().sum();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;

        stats.min_rtt = rtts.iter().copied().min().unwrap_or_default();
        stats.max_rtt = rtts.iter().copied().max().unwrap_or_default();
        stats.avg_rtt = total / packets_recv as u32;
        stats.std_dev_rtt = Duration::from_nanos(calculate_std_dev(&samples, mean).round() as u64);
        stats.rtts = rtts;
        stats
    }

    /// Compute the run aggregate
    pub fn aggregate(&self) -> QosAggregate {
        aggregate(self.packet_count, self.timeout, &self.statistics())
    }
}

/// Compute QoS aggregates from transport statistics
///
/// Jitter is the absolute difference between consecutive received
/// round-trips in sequence order. Each lost packet adds `timeout` to both the
/// latency total and the jitter total.
pub fn aggregate(packet_count: usize, timeout: Duration, stats: &PingStatistics) -> QosAggregate {
    let sent = stats.packets_sent;
    let received = stats.packets_recv;
    let lost = sent.saturating_sub(received);
    let penalty = timeout * lost as u32;

    let mut jitter_sum = Duration::ZERO;
    let mut jitter_max = Duration::ZERO;
    let mut jitter_min: Option<Duration> = None;
    for pair in stats.rtts.windows(2) {
        let jitter = abs_diff(pair[1], pair[0]);
        jitter_sum += jitter;
        jitter_max = jitter_max.max(jitter);
        jitter_min = Some(jitter_min.map_or(jitter, |min| min.min(jitter)));
    }
    let jitter_total = jitter_sum + penalty;

    let jitter_divisor = if received == 0 {
        sent.saturating_sub(1).max(1)
    } else {
        received.saturating_sub(1).max(1)
    };

    let latency_total = stats.rtts.iter().sum::<Duration>() + penalty;
    let latency_divisor = if received > 0 { received } else { sent };
    let latency_avg_ms = if latency_divisor == 0 {
        0.0
    } else {
        to_millis(latency_total) / latency_divisor as f64
    };

    QosAggregate {
        packet_count,
        packets_sent: sent,
        packets_received: received,
        packets_lost: lost,
        loss_percentage: stats.packet_loss,
        latency_total_ms: to_millis(latency_total),
        latency_min_ms: to_millis(stats.min_rtt),
        latency_max_ms: to_millis(stats.max_rtt),
        latency_avg_ms,
        latency_std_dev_ms: to_millis(stats.std_dev_rtt),
        jitter_total_us: to_micros(jitter_total),
        jitter_max_us: to_micros(jitter_max),
        jitter_min_us: to_micros(jitter_min.unwrap_or_default()),
        jitter_mean_us: to_micros(jitter_total) / jitter_divisor as f64,
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Duration in microseconds
pub fn to_micros(d: Duration) -> f64 {
    d.as_nanos() as f64 / NANOS_PER_MICRO
}

/// Duration in milliseconds
pub fn to_millis(d: Duration) -> f64 {
    to_micros(d) / MICROS_PER_MILLI
}

/// Calculate population standard deviation
///
/// # Arguments
///
/// * `samples` - Slice of values
/// * `mean` - Mean of the values
pub fn calculate_std_dev(samples: &[f64], mean: f64) -> f64 {
    if samples.len() <= 1 {
        return 0.0;
    }

    let variance: f64 = samples
        .iter()
        .map(|x| (x - mean).powi(2))
        .sum::<f64>()
        / samples.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn run(count: u16, replies: &[(u16, Duration)]) -> QosAggregate {
        let mut collector = QosCollector::new(count as usize, TIMEOUT);
        for seq in 0..count {
            collector.add_event(&PacketEvent::Sent { seq });
        }
        for &(seq, rtt) in replies {
            collector.add_event(&PacketEvent::Received { seq, rtt });
        }
        for seq in 0..count {
            if !replies.iter().any(|(s, _)| *s == seq) {
                collector.add_event(&PacketEvent::Lost { seq });
            }
        }
        collector.aggregate()
    }

    #[test]
    fn test_no_loss() {
        let agg = run(3, &[(0, ms(10)), (1, ms(20)), (2, ms(15))]);

        assert_eq!(agg.packets_lost, 0);
        assert_eq!(agg.loss_percentage, 0.0);
        assert_eq!(agg.latency_total_ms, 45.0);
        assert_eq!(agg.latency_avg_ms, 15.0);
        assert_eq!(agg.latency_min_ms, 10.0);
        assert_eq!(agg.latency_max_ms, 20.0);
        assert_eq!(agg.jitter_total_us, 15_000.0);
        assert_eq!(agg.jitter_max_us, 10_000.0);
        assert_eq!(agg.jitter_min_us, 5_000.0);
        assert_eq!(agg.jitter_mean_us, 7_500.0);
    }

    #[test]
    fn test_total_loss_is_penalized() {
        let agg = run(4, &[]);

        assert_eq!(agg.packets_sent, 4);
        assert_eq!(agg.packets_received, 0);
        assert_eq!(agg.packets_lost, 4);
        assert_eq!(agg.loss_percentage, 100.0);
        assert_eq!(agg.latency_total_ms, 4_000.0);
        assert_eq!(agg.latency_avg_ms, 1_000.0);
        // sent - 1 divisor
        assert_eq!(agg.jitter_total_us, 4_000_000.0);
        assert_eq!(agg.jitter_mean_us, 4_000_000.0 / 3.0);
        assert_eq!(agg.jitter_max_us, 0.0);
        assert_eq!(agg.jitter_min_us, 0.0);
    }

    #[test]
    fn test_total_loss_single_packet() {
        let agg = run(1, &[]);

        assert_eq!(agg.latency_avg_ms, 1_000.0);
        assert!(agg.jitter_mean_us.is_finite());
        assert_eq!(agg.jitter_mean_us, 1_000_000.0);
    }

    #[test]
    fn test_single_reply_has_no_jitter_sample() {
        let agg = run(1, &[(0, ms(7))]);

        assert_eq!(agg.jitter_total_us, 0.0);
        assert_eq!(agg.jitter_mean_us, 0.0);
        assert_eq!(agg.latency_avg_ms, 7.0);
    }

    #[test]
    fn test_nothing_sent() {
        let agg = QosCollector::new(5, TIMEOUT).aggregate();

        assert_eq!(agg.packet_count, 5);
        assert_eq!(agg.packets_sent, 0);
        assert_eq!(agg.loss_percentage, 0.0);
        assert_eq!(agg.latency_avg_ms, 0.0);
        assert_eq!(agg.jitter_mean_us, 0.0);
    }

    #[test]
    fn test_loss_in_the_middle() {
        let agg = run(
            5,
            &[(0, ms(10)), (1, ms(12)), (2, ms(11)), (4, ms(13))],
        );

        assert_eq!(agg.packets_sent, 5);
        assert_eq!(agg.packets_received, 4);
        assert_eq!(agg.packets_lost, 1);
        assert_eq!(agg.loss_percentage, 20.0);
        assert_eq!(agg.latency_total_ms, 1_046.0);
        assert_eq!(agg.latency_avg_ms, 261.5);
        assert_eq!(agg.jitter_total_us, 1_005_000.0);
        assert_eq!(agg.jitter_max_us, 2_000.0);
        assert_eq!(agg.jitter_min_us, 1_000.0);
        assert_eq!(agg.jitter_mean_us, 335_000.0);
        assert!((agg.latency_std_dev_ms - 1.118034).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_order_replies_use_sequence_order() {
        let in_order = run(3, &[(0, ms(10)), (1, ms(30)), (2, ms(20))]);
        let reordered = run(3, &[(2, ms(20)), (0, ms(10)), (1, ms(30))]);

        assert_eq!(in_order, reordered);
        assert_eq!(reordered.jitter_total_us, 30_000.0);
    }

    #[test]
    fn test_duplicates_and_late_replies() {
        let mut collector = QosCollector::new(2, TIMEOUT);
        collector.add_event(&PacketEvent::Sent { seq: 0 });
        collector.add_event(&PacketEvent::Sent { seq: 1 });
        collector.add_event(&PacketEvent::Received { seq: 0, rtt: ms(5) });
        collector.add_event(&PacketEvent::Received { seq: 0, rtt: ms(9) });
        collector.add_event(&PacketEvent::Lost { seq: 1 });
        collector.add_event(&PacketEvent::Received { seq: 1, rtt: ms(1500) });

        let stats = collector.statistics();
        assert_eq!(stats.packets_recv, 1);
        assert_eq!(stats.packets_recv_duplicates, 1);
        assert_eq!(stats.rtts, vec![ms(5)]);
    }

    #[test]
    fn test_jitter_bounds() {
        let agg = run(
            6,
            &[(0, ms(3)), (1, ms(9)), (2, ms(4)), (3, ms(4)), (4, ms(20)), (5, ms(1))],
        );
        assert!(agg.jitter_total_us >= 0.0);
        assert!(agg.jitter_max_us >= agg.jitter_min_us);
        assert_eq!(agg.jitter_min_us, 0.0);
        assert_eq!(agg.jitter_max_us, 19_000.0);
    }

    #[test]
    fn test_unit_conversion_is_exact() {
        for micros in [1u64, 7, 999, 1_234, 1_000_000, 987_654_321] {
            let d = Duration::from_micros(micros);
            assert_eq!(to_micros(d), micros as f64);
            assert_eq!(to_millis(d), micros as f64 / 1000.0);
        }

        // A lost packet contributes exactly timeout/1000 milliseconds.
        let timeout = Duration::from_micros(1_234_567);
        let mut collector = QosCollector::new(1, timeout);
        collector.add_event(&PacketEvent::Sent { seq: 0 });
        collector.add_event(&PacketEvent::Lost { seq: 0 });
        assert_eq!(collector.aggregate().latency_total_ms, 1_234_567.0 / 1000.0);
    }

    #[test]
    fn test_std_dev() {
        assert_eq!(calculate_std_dev(&[5.0], 5.0), 0.0);
        assert_eq!(calculate_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 5.0), 2.0);
    }
}
