//! ICMP QoS prober
//!
//! Sends a series of echo requests, buffers the packet events by sequence
//! number and folds them into loss, latency and jitter gauges when the series
//! finishes or the deadline expires.

use super::Prober;
use crate::config::{IcmpQosProbe, Module};
use crate::icmp::{EchoSession, EchoTransport, SessionOptions};
use crate::logger::ScrapeLogger;
use crate::qos::{self, QosAggregate, QosCollector};
use async_trait::async_trait;
use humantime::format_duration;
use probe_common::constants::*;
use probe_common::PacketEvent;
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};

/// Measurement families of one QoS run
pub struct QosGauges {
    duration: Gauge,
    latency: GaugeVec,
    packet_loss: GaugeVec,
    jitter_gauge: GaugeVec,
    jitter: Gauge,
    packet_count: Gauge,
}

impl QosGauges {
    /// Create the families and register them into `registry`
    ///
    /// Every label value is initialised so that all series are present in the
    /// snapshot even when the run fails before producing an aggregate.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let gauges = Self {
            duration: Gauge::new(QOS_DURATION_SECONDS, QOS_DURATION_SECONDS_HELP)?,
            latency: GaugeVec::new(Opts::new(QOS_LATENCY, QOS_LATENCY_HELP), &[LABEL_AGGREGATE])?,
            packet_loss: GaugeVec::new(Opts::new(QOS_PACKET_LOSS, QOS_PACKET_LOSS_HELP), &[LABEL_TOTAL])?,
            jitter_gauge: GaugeVec::new(
                Opts::new(QOS_JITTER_GAUGE, QOS_JITTER_GAUGE_HELP),
                &[LABEL_AGGREGATE],
            )?,
            jitter: Gauge::new(QOS_JITTER, QOS_JITTER_HELP)?,
            packet_count: Gauge::new(QOS_PACKET_COUNT, QOS_PACKET_COUNT_HELP)?,
        };

        registry.register(Box::new(gauges.duration.clone()))?;
        registry.register(Box::new(gauges.latency.clone()))?;
        registry.register(Box::new(gauges.packet_loss.clone()))?;
        registry.register(Box::new(gauges.jitter_gauge.clone()))?;
        registry.register(Box::new(gauges.jitter.clone()))?;
        registry.register(Box::new(gauges.packet_count.clone()))?;

        for aggregate in LATENCY_AGGREGATES {
            gauges.latency.with_label_values(&[aggregate]);
        }
        for total in PACKET_LOSS_TOTALS {
            gauges.packet_loss.with_label_values(&[total]);
        }
        for aggregate in JITTER_AGGREGATES {
            gauges.jitter_gauge.with_label_values(&[aggregate]);
        }

        Ok(gauges)
    }

    /// Publish an aggregate and the execution time of the series
    pub fn set(&self, aggregate: &QosAggregate, elapsed: Duration) {
        self.duration.set(elapsed.as_secs_f64());

        let latency = [
            aggregate.latency_total_ms,
            aggregate.latency_min_ms,
            aggregate.latency_max_ms,
            aggregate.latency_avg_ms,
            aggregate.latency_std_dev_ms,
        ];
        for (label, value) in LATENCY_AGGREGATES.into_iter().zip(latency) {
            self.latency.with_label_values(&[label]).set(value);
        }

        let packet_loss = [
            aggregate.packets_sent as f64,
            aggregate.packets_received as f64,
            aggregate.packets_lost as f64,
            aggregate.loss_percentage,
        ];
        for (label, value) in PACKET_LOSS_TOTALS.into_iter().zip(packet_loss) {
            self.packet_loss.with_label_values(&[label]).set(value);
        }

        let jitter = [
            aggregate.jitter_total_us,
            aggregate.jitter_max_us,
            aggregate.jitter_min_us,
        ];
        for (label, value) in JITTER_AGGREGATES.into_iter().zip(jitter) {
            self.jitter_gauge.with_label_values(&[label]).set(value);
        }

        self.jitter.set(aggregate.jitter_mean_us);
        self.packet_count.set(aggregate.packet_count as f64);
    }
}

/// How a series ended
enum RunOutcome {
    /// Every packet was sent and answered or timed out
    Completed,
    DeadlineExceeded,
    /// The session stopped delivering replies
    SessionFailed(io::Error),
    /// The schedule ran past the clock's range
    ClockOverflow,
}

/// ICMP QoS prober over an [`EchoTransport`]
pub struct IcmpQosProber<T> {
    transport: T,
}

impl<T: EchoTransport> IcmpQosProber<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: EchoTransport> Prober for IcmpQosProber<T> {
    async fn probe(
        &self,
        deadline: Instant,
        target: &str,
        module: &Module,
        registry: &Registry,
        logger: &ScrapeLogger,
    ) -> bool {
        let params = &module.icmp_qos;
        let start = Instant::now();

        if let Err(reason) = params.check() {
            logger.error(
                "Invalid ICMP QoS parameters",
                &[
                    ("reason", &reason),
                    ("packet_size", &params.packet_size),
                    ("count", &params.count),
                    ("interval", &format_duration(params.interval)),
                    ("timeout", &format_duration(params.timeout)),
                ],
            );
            return false;
        }

        let gauges = match QosGauges::register(registry) {
            Ok(gauges) => gauges,
            Err(err) => {
                logger.error("Failed to register QoS metrics", &[("err", &err)]);
                return false;
            }
        };

        logger.debug(
            "Set Pinger",
            &[
                ("packet_size", &params.packet_size),
                ("count", &params.count),
                ("interval", &format_duration(params.interval)),
                ("timeout", &format_duration(params.timeout)),
                ("ttl", &params.ttl),
                ("privileged", &params.privileged),
            ],
        );

        let options = SessionOptions::from(params);
        let mut session = match timeout_at(deadline, self.transport.open(target, &options)).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                logger.error("Set pinger failed", &[("err", &err)]);
                gauges.set(&QosCollector::new(params.count, params.timeout).aggregate(), start.elapsed());
                return false;
            }
            Err(_) => {
                logger.error("Deadline exceeded while setting up pinger", &[]);
                gauges.set(&QosCollector::new(params.count, params.timeout).aggregate(), start.elapsed());
                return false;
            }
        };

        logger.info("Pinger started", &[("address", &session.remote())]);

        let mut collector = QosCollector::new(params.count, params.timeout);
        let outcome = run_series(session.as_mut(), params, deadline, &mut collector, logger).await;
        drop(session);

        let stats = collector.statistics();
        let aggregate = qos::aggregate(params.count, params.timeout, &stats);
        let elapsed = start.elapsed();
        gauges.set(&aggregate, elapsed);

        logger.info(
            "ICMP Gauge summary",
            &[
                ("packets_sent", &aggregate.packets_sent),
                ("packets_received", &aggregate.packets_received),
                ("duplicates", &stats.packets_recv_duplicates),
                ("loss_percentage", &aggregate.loss_percentage),
                ("latency_total_ms", &aggregate.latency_total_ms),
                ("latency_avg_ms", &aggregate.latency_avg_ms),
                ("latency_std_dev_ms", &aggregate.latency_std_dev_ms),
                ("jitter_total_us", &aggregate.jitter_total_us),
                ("jitter_mean_us", &aggregate.jitter_mean_us),
            ],
        );
        logger.debug("ICMP Execution duration", &[("seconds", &elapsed.as_secs_f64())]);

        match outcome {
            RunOutcome::Completed => true,
            RunOutcome::DeadlineExceeded => {
                logger.error(
                    "Deadline exceeded before the series finished",
                    &[("sent", &aggregate.packets_sent), ("count", &params.count)],
                );
                false
            }
            RunOutcome::SessionFailed(err) => {
                logger.error("Pinger failed", &[("err", &err)]);
                false
            }
            RunOutcome::ClockOverflow => {
                logger.error(
                    "Series schedule overflowed the clock",
                    &[
                        ("interval", &format_duration(params.interval)),
                        ("timeout", &format_duration(params.timeout)),
                    ],
                );
                false
            }
        }
    }
}

/// Drive one echo series
///
/// Requests go out every `interval` until `count` were sent. A request with
/// no reply within `timeout` is recorded as lost, and so is a request whose
/// send failed. Replies arriving after their packet was declared lost are
/// dropped.
async fn run_series(
    session: &mut dyn EchoSession,
    params: &IcmpQosProbe,
    deadline: Instant,
    collector: &mut QosCollector,
    logger: &ScrapeLogger,
) -> RunOutcome {
    let count = params.count;
    let mut next_seq = 0usize;
    let mut next_send = Instant::now();
    // seq -> instant the packet is declared lost
    let mut pending: BTreeMap<u16, Instant> = BTreeMap::new();
    let mut answered: BTreeSet<u16> = BTreeSet::new();

    loop {
        if next_seq >= count && pending.is_empty() {
            return RunOutcome::Completed;
        }
        let next_expiry = pending.values().min().copied();

        tokio::select! {
            biased;

            _ = sleep_until(deadline) => return RunOutcome::DeadlineExceeded,

            reply = session.recv() => match reply {
                Ok(reply) => {
                    if pending.remove(&reply.seq).is_some() || answered.contains(&reply.seq) {
                        answered.insert(reply.seq);
                        logger.debug(
                            "Ping Log",
                            &[("seq", &reply.seq), ("rtt", &format!("{:?}", reply.rtt))],
                        );
                        collector.add_event(&PacketEvent::Received {
                            seq: reply.seq,
                            rtt: reply.rtt,
                        });
                    }
                }
                Err(err) => {
                    let Some(seq) = pending.keys().next().copied() else {
                        return RunOutcome::SessionFailed(err);
                    };
                    pending.remove(&seq);
                    logger.warn("Receive error", &[("seq", &seq), ("err", &err)]);
                    collector.add_event(&PacketEvent::Lost { seq });
                }
            },

            _ = sleep_until(next_expiry.unwrap_or(deadline)), if next_expiry.is_some() => {
                let now = Instant::now();
                let expired: Vec<u16> = pending
                    .iter()
                    .filter(|(_, lost_at)| **lost_at <= now)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in expired {
                    pending.remove(&seq);
                    logger.debug("Packet timed out", &[("seq", &seq)]);
                    collector.add_event(&PacketEvent::Lost { seq });
                }
            },

            _ = sleep_until(next_send), if next_seq < count => {
                // count is bounded by the sequence number space
                let seq = next_seq as u16;
                collector.add_event(&PacketEvent::Sent { seq });
                match session.send(seq).await {
                    Ok(()) => {
                        let Some(lost_at) = Instant::now().checked_add(params.timeout) else {
                            return RunOutcome::ClockOverflow;
                        };
                        pending.insert(seq, lost_at);
                    }
                    Err(err) => {
                        logger.warn("Send error", &[("seq", &seq), ("err", &err)]);
                        collector.add_event(&PacketEvent::Lost { seq });
                    }
                }
                next_seq += 1;
                next_send = match next_send.checked_add(params.interval) {
                    Some(at) => at,
                    None => return RunOutcome::ClockOverflow,
                };
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::testing::ScriptedTransport;
    use crate::snapshot::MetricSnapshot;
    use probe_common::ProbeKind;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn module(count: usize, interval: Duration) -> Module {
        let mut module = Module::new(ProbeKind::IcmpQos);
        module.icmp_qos = IcmpQosProbe {
            packet_size: 56,
            count,
            interval,
            timeout: ms(1000),
            ..Default::default()
        };
        module
    }

    async fn run(transport: ScriptedTransport, module: &Module, budget: Duration) -> (bool, MetricSnapshot, String) {
        let prober = IcmpQosProber::new(transport);
        let registry = Registry::new();
        let logger = ScrapeLogger::new("icmp_qos", "192.0.2.1");
        let deadline = Instant::now() + budget;
        let success = prober.probe(deadline, "192.0.2.1", module, &registry, &logger).await;
        (success, MetricSnapshot::gather(success, &registry), logger.contents())
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_with_one_loss() {
        let transport = ScriptedTransport::new(&[(0, ms(10)), (1, ms(12)), (2, ms(11)), (4, ms(13))]);
        let (success, snapshot, logs) = run(transport, &module(5, ms(100)), Duration::from_secs(10)).await;

        assert!(success);
        let loss = |total: &str| snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, total)]);
        assert_eq!(loss("sent"), Some(5.0));
        assert_eq!(loss("received"), Some(4.0));
        assert_eq!(loss("loss"), Some(1.0));
        assert_eq!(loss("loss_percentage"), Some(20.0));

        let latency = |agg: &str| snapshot.value(QOS_LATENCY, &[(LABEL_AGGREGATE, agg)]);
        assert_eq!(latency("total"), Some(1046.0));
        assert_eq!(latency("avg"), Some(261.5));
        assert_eq!(latency("min"), Some(10.0));
        assert_eq!(latency("max"), Some(13.0));
        assert!((latency("standard_deviation").unwrap() - 1.118034).abs() < 1e-6);

        let jitter = |agg: &str| snapshot.value(QOS_JITTER_GAUGE, &[(LABEL_AGGREGATE, agg)]);
        assert_eq!(jitter("total_diff"), Some(1_005_000.0));
        assert_eq!(jitter("max_diff"), Some(2_000.0));
        assert_eq!(jitter("min_diff"), Some(1_000.0));
        assert_eq!(snapshot.value(QOS_JITTER, &[]), Some(335_000.0));
        assert_eq!(snapshot.value(QOS_PACKET_COUNT, &[]), Some(5.0));

        // The lost packet went out at 300ms and timed out 1s later.
        let duration = snapshot.value(QOS_DURATION_SECONDS, &[]).unwrap();
        assert!((duration - 1.3).abs() < 0.01, "duration {}", duration);

        assert!(logs.contains("msg=\"ICMP Gauge summary\""));
        assert!(logs.contains("msg=\"Packet timed out\" seq=3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_without_loss() {
        let transport = ScriptedTransport::new(&[(0, ms(5)), (1, ms(5)), (2, ms(5))]);
        let (success, snapshot, _) = run(transport, &module(3, ms(10)), Duration::from_secs(5)).await;

        assert!(success);
        assert_eq!(snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "loss")]), Some(0.0));
        assert_eq!(snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "loss_percentage")]), Some(0.0));
        assert_eq!(snapshot.value(QOS_JITTER, &[]), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_loss_is_not_a_failure() {
        let transport = ScriptedTransport::new(&[]);
        let (success, snapshot, _) = run(transport, &module(2, ms(100)), Duration::from_secs(5)).await;

        assert!(success);
        assert_eq!(snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "loss_percentage")]), Some(100.0));
        assert_eq!(snapshot.value(QOS_LATENCY, &[(LABEL_AGGREGATE, "avg")]), Some(1000.0));
        assert_eq!(snapshot.value(QOS_JITTER, &[]), Some(2_000_000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_with_partial_aggregate() {
        let transport = ScriptedTransport::new(&[]);
        let (success, snapshot, logs) = run(transport, &module(5, ms(500)), Duration::from_secs(1)).await;

        assert!(!success);
        let sent = snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "sent")]).unwrap();
        assert!(sent >= 1.0 && sent < 5.0, "sent {}", sent);
        assert_eq!(snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "received")]), Some(0.0));
        assert!(logs.contains("Deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_setup_failure() {
        let (success, snapshot, logs) =
            run(ScriptedTransport::unreachable(), &module(5, ms(100)), Duration::from_secs(5)).await;

        assert!(!success);
        assert!(logs.contains("msg=\"Set pinger failed\""));
        assert_eq!(snapshot.value(QOS_PACKET_COUNT, &[]), Some(5.0));
        assert_eq!(snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "sent")]), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_parameters_fail_fast() {
        let mut module = module(5, ms(100));
        module.icmp_qos.count = 0;
        let (success, snapshot, logs) =
            run(ScriptedTransport::new(&[]), &module, Duration::from_secs(5)).await;

        assert!(!success);
        assert!(snapshot.families().is_empty());
        assert!(logs.contains("Invalid ICMP QoS parameters"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_parameters_fail_fast() {
        let huge_interval = module(2, Duration::from_secs(u64::MAX / 2));
        let mut huge_payload = module(2, ms(100));
        huge_payload.icmp_qos.packet_size = 1 << 40;
        let mut huge_timeout = module(2, ms(100));
        huge_timeout.icmp_qos.timeout = Duration::MAX;

        for module in [huge_interval, huge_payload, huge_timeout] {
            let (success, snapshot, logs) =
                run(ScriptedTransport::new(&[(0, ms(5))]), &module, Duration::from_secs(5)).await;
            assert!(!success);
            assert!(snapshot.families().is_empty());
            assert!(logs.contains("msg=\"Invalid ICMP QoS parameters\""), "{}", logs);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_overflow_ends_series() {
        let transport = ScriptedTransport::new(&[(0, ms(5))]);
        let options = SessionOptions::from(&IcmpQosProbe::default());
        let mut session = transport.open("192.0.2.1", &options).await.unwrap();
        let logger = ScrapeLogger::new("icmp_qos", "192.0.2.1");
        let deadline = Instant::now() + Duration::from_secs(5);

        let params = IcmpQosProbe {
            count: 2,
            interval: Duration::from_secs(u64::MAX / 2),
            ..Default::default()
        };
        let mut collector = QosCollector::new(params.count, params.timeout);
        let outcome = run_series(session.as_mut(), &params, deadline, &mut collector, &logger).await;
        assert!(matches!(outcome, RunOutcome::ClockOverflow));
        assert_eq!(collector.statistics().packets_sent, 1);

        let params = IcmpQosProbe {
            count: 1,
            timeout: Duration::MAX,
            ..Default::default()
        };
        let mut collector = QosCollector::new(params.count, Duration::from_secs(1));
        let outcome = run_series(session.as_mut(), &params, deadline, &mut collector, &logger).await;
        assert!(matches!(outcome, RunOutcome::ClockOverflow));
    }

    #[test]
    fn test_gauges_register_all_series() {
        let registry = Registry::new();
        QosGauges::register(&registry).unwrap();
        let snapshot = MetricSnapshot::gather(false, &registry);

        assert_eq!(snapshot.families().len(), 6);
        for agg in LATENCY_AGGREGATES {
            assert_eq!(snapshot.value(QOS_LATENCY, &[(LABEL_AGGREGATE, agg)]), Some(0.0));
        }
        for total in PACKET_LOSS_TOTALS {
            assert_eq!(snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, total)]), Some(0.0));
        }

        // A second registration into the same registry is rejected.
        assert!(QosGauges::register(&registry).is_err());
    }
}
