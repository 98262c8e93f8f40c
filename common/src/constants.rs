//! Shared constants for the QoS probes
//!
//! Measurement names and label values are consumed by downstream telemetry
//! pipelines and must not change.

// ============================================================================
// Orchestrator Measurements
// ============================================================================

/// Binary success indicator emitted for every run
pub const PROBE_SUCCESS: &str = "probe_success";

/// Help text for [`PROBE_SUCCESS`]
pub const PROBE_SUCCESS_HELP: &str = "Displays whether or not the probe was a success";

/// Wall-clock duration of the whole run
pub const PROBE_DURATION_SECONDS: &str = "probe_duration_seconds";

/// Help text for [`PROBE_DURATION_SECONDS`]
pub const PROBE_DURATION_SECONDS_HELP: &str = "Returns how long the probe took to complete in seconds";

// ============================================================================
// ICMP QoS Measurements
// ============================================================================

/// Duration of the pinger execution
pub const QOS_DURATION_SECONDS: &str = "probe_qos_duration_seconds";

/// Help text for [`QOS_DURATION_SECONDS`]
pub const QOS_DURATION_SECONDS_HELP: &str = "Total Durations of the pinger executions (in seconds)";

/// Latency aggregates in milliseconds, labelled by `aggregate`
pub const QOS_LATENCY: &str = "probe_qos_latency_gauge";

/// Help text for [`QOS_LATENCY`]
pub const QOS_LATENCY_HELP: &str = "Probe QoS Latency Gauge (all are in milliseconds)";

/// Packet loss counters, labelled by `total`
pub const QOS_PACKET_LOSS: &str = "probe_qos_packet_loss";

/// Help text for [`QOS_PACKET_LOSS`]
pub const QOS_PACKET_LOSS_HELP: &str = "Probe QoS Latency Packet Loss";

/// Jitter aggregates in microseconds, labelled by `aggregate`
pub const QOS_JITTER_GAUGE: &str = "probe_qos_jitter_gauge";

/// Help text for [`QOS_JITTER_GAUGE`]
pub const QOS_JITTER_GAUGE_HELP: &str = "Probe QoS Jitter Gauge (all are in microseconds)";

/// Mean jitter in microseconds
pub const QOS_JITTER: &str = "probe_qos_jitter";

/// Help text for [`QOS_JITTER`]
pub const QOS_JITTER_HELP: &str = "Jitter Calculations and Aggregates (in microseconds)";

/// Number of packets configured for the run
pub const QOS_PACKET_COUNT: &str = "probe_qos_packet_count";

/// Help text for [`QOS_PACKET_COUNT`]
pub const QOS_PACKET_COUNT_HELP: &str = "Total number of tested data to be sent to target";

/// Label name for latency and jitter aggregates
pub const LABEL_AGGREGATE: &str = "aggregate";

/// Label name for packet loss totals
pub const LABEL_TOTAL: &str = "total";

/// Label values of [`QOS_LATENCY`]
pub const LATENCY_AGGREGATES: [&str; 5] = ["total", "min", "max", "avg", "standard_deviation"];

/// Label values of [`QOS_PACKET_LOSS`]
pub const PACKET_LOSS_TOTALS: [&str; 4] = ["sent", "received", "loss", "loss_percentage"];

/// Label values of [`QOS_JITTER_GAUGE`]
pub const JITTER_AGGREGATES: [&str; 3] = ["total_diff", "max_diff", "min_diff"];

// ============================================================================
// Supplemental Prober Measurements
// ============================================================================

/// Round-trip time of a single echo, labelled by `phase`
pub const ICMP_DURATION_SECONDS: &str = "probe_icmp_duration_seconds";

/// Help text for [`ICMP_DURATION_SECONDS`]
pub const ICMP_DURATION_SECONDS_HELP: &str = "Duration of icmp request by phase";

/// IP protocol version used by the probe
pub const IP_PROTOCOL: &str = "probe_ip_protocol";

/// Help text for [`IP_PROTOCOL`]
pub const IP_PROTOCOL_HELP: &str = "Specifies whether probe ip protocol is IP4 or IP6";

/// Time taken to establish a TCP connection
pub const TCP_CONNECT_DURATION_SECONDS: &str = "probe_tcp_connect_duration_seconds";

/// Help text for [`TCP_CONNECT_DURATION_SECONDS`]
pub const TCP_CONNECT_DURATION_SECONDS_HELP: &str = "Duration of the TCP connection setup in seconds";

// ============================================================================
// ICMP QoS Defaults
// ============================================================================

/// Default payload size in bytes
pub const DEFAULT_PACKET_SIZE: usize = 56;

/// Default number of echo requests per run
pub const DEFAULT_PACKET_COUNT: usize = 5;

/// Default inter-packet interval in milliseconds
pub const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Default per-packet timeout in milliseconds
pub const DEFAULT_PACKET_TIMEOUT_MS: u64 = 1_000;

/// Default IP time-to-live
pub const DEFAULT_TTL: u32 = 64;

/// Default module timeout in seconds
pub const DEFAULT_MODULE_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Unit Conversion
// ============================================================================

/// Nanoseconds per microsecond
pub const NANOS_PER_MICRO: f64 = 1_000.0;

/// Microseconds per millisecond
pub const MICROS_PER_MILLI: f64 = 1_000.0;

// ============================================================================
// History
// ============================================================================

/// Default number of retained run traces
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
