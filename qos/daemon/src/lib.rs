//! Blackbox QoS probe library
//!
//! Resolves probe modules, runs them under a deadline and turns ICMP echo
//! series into packet loss, latency and jitter measurements.

pub mod blackbox;
pub mod config;
pub mod error;
pub mod exporter;
pub mod history;
pub mod icmp;
pub mod logger;
pub mod prober;
pub mod qos;
pub mod resolver;
pub mod snapshot;

pub use blackbox::{Blackbox, ExporterMetrics};
pub use config::{Config, Module, SafeConfig};
pub use error::ProbeError;
pub use exporter::{ExporterType, JsonExporter, MetricsExporter, TextExporter};
pub use history::{HistoryEntry, ResultHistory};
pub use prober::{Prober, ProberRegistry};
pub use qos::{QosAggregate, QosCollector};
pub use resolver::{ConfigResolver, ProbeRequest};
pub use snapshot::MetricSnapshot;
