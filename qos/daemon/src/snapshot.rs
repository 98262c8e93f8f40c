//! Metric snapshots
//!
//! A [`MetricSnapshot`] is the gathered family list of one run's registry.
//! It encodes to the Prometheus text exposition format and to a JSON document
//! mirroring the family structure.

use crate::error::ProbeError;
use prometheus::proto::{MetricFamily, MetricType};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

/// Gathered measurements of one run
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    success: bool,
    families: Vec<MetricFamily>,
}

/// JSON form of a metric family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyDocument {
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub metric: Vec<MetricDocument>,
}

/// JSON form of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDocument {
    #[serde(default)]
    pub label: Vec<LabelDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gauge: Option<ValueDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<ValueDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub untyped: Option<ValueDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<HistogramDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDocument {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueDocument {
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryDocument {
    pub sample_count: u64,
    pub sample_sum: f64,
    pub quantile: Vec<QuantileDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileDocument {
    pub quantile: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramDocument {
    pub sample_count: u64,
    pub sample_sum: f64,
    pub bucket: Vec<BucketDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketDocument {
    pub cumulative_count: u64,
    pub upper_bound: f64,
}

impl MetricSnapshot {
    pub fn new(success: bool, families: Vec<MetricFamily>) -> Self {
        Self { success, families }
    }

    /// Collect every family of `registry`
    pub fn gather(success: bool, registry: &Registry) -> Self {
        Self::new(success, registry.gather())
    }

    /// Outcome of the run
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn families(&self) -> &[MetricFamily] {
        &self.families
    }

    /// Prometheus text exposition
    pub fn text(&self) -> Result<String, ProbeError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Structured form of the family list
    pub fn documents(&self) -> Vec<FamilyDocument> {
        self.families.iter().map(family_document).collect()
    }

    pub fn json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.documents())
    }

    pub fn json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.documents())
    }

    /// Value of the gauge, counter or untyped series named `name` whose
    /// labels are exactly `labels`
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let family = self.families.iter().find(|family| family.get_name() == name)?;
        family
            .get_metric()
            .iter()
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(name, value)| {
                        pairs
                            .iter()
                            .any(|pair| pair.get_name() == *name && pair.get_value() == *value)
                    })
            })
            .map(|metric| match family.get_field_type() {
                MetricType::COUNTER => metric.get_counter().get_value(),
                MetricType::UNTYPED => metric.get_untyped().get_value(),
                _ => metric.get_gauge().get_value(),
            })
    }
}

fn type_name(kind: MetricType) -> &'static str {
    match kind {
        MetricType::COUNTER => "counter",
        MetricType::GAUGE => "gauge",
        MetricType::SUMMARY => "summary",
        MetricType::UNTYPED => "untyped",
        MetricType::HISTOGRAM => "histogram",
    }
}

fn family_document(family: &MetricFamily) -> FamilyDocument {
    let kind = family.get_field_type();
    let metric = family
        .get_metric()
        .iter()
        .map(|metric| {
            let mut document = MetricDocument {
                label: metric
                    .get_label()
                    .iter()
                    .map(|pair| LabelDocument {
                        name: pair.get_name().to_string(),
                        value: pair.get_value().to_string(),
                    })
                    .collect(),
                gauge: None,
                counter: None,
                untyped: None,
                summary: None,
                histogram: None,
                timestamp_ms: (metric.get_timestamp_ms() != 0).then(|| metric.get_timestamp_ms()),
            };
            match kind {
                MetricType::GAUGE => {
                    document.gauge = Some(ValueDocument {
                        value: metric.get_gauge().get_value(),
                    })
                }
                MetricType::COUNTER => {
                    document.counter = Some(ValueDocument {
                        value: metric.get_counter().get_value(),
                    })
                }
                MetricType::UNTYPED => {
                    document.untyped = Some(ValueDocument {
                        value: metric.get_untyped().get_value(),
                    })
                }
                MetricType::SUMMARY => {
                    let summary = metric.get_summary();
                    document.summary = Some(SummaryDocument {
                        sample_count: summary.get_sample_count(),
                        sample_sum: summary.get_sample_sum(),
                        quantile: summary
                            .get_quantile()
                            .iter()
                            .map(|q| QuantileDocument {
                                quantile: q.get_quantile(),
                                value: q.get_value(),
                            })
                            .collect(),
                    })
                }
                MetricType::HISTOGRAM => {
                    let histogram = metric.get_histogram();
                    document.histogram = Some(HistogramDocument {
                        sample_count: histogram.get_sample_count(),
                        sample_sum: histogram.get_sample_sum(),
                        bucket: histogram
                            .get_bucket()
                            .iter()
                            .map(|b| BucketDocument {
                                cumulative_count: b.get_cumulative_count(),
                                upper_bound: b.get_upper_bound(),
                            })
                            .collect(),
                    })
                }
            }
            document
        })
        .collect();

    FamilyDocument {
        name: family.get_name().to_string(),
        help: family.get_help().to_string(),
        kind: type_name(kind).to_string(),
        metric,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Gauge, GaugeVec, IntCounter, Opts};
    use std::collections::HashMap;

    fn sample_registry() -> Registry {
        let registry = Registry::new();
        let latency = GaugeVec::new(Opts::new("probe_qos_latency_gauge", "latency"), &["aggregate"]).unwrap();
        latency.with_label_values(&["avg"]).set(261.5);
        latency.with_label_values(&["standard_deviation"]).set(1.118034);
        latency.with_label_values(&["total"]).set(0.1 + 0.2);
        let jitter = Gauge::new("probe_qos_jitter", "jitter").unwrap();
        jitter.set(335_000.0);
        let unknown = IntCounter::new("blackbox_module_unknown_total", "unknown").unwrap();
        unknown.inc();

        registry.register(Box::new(latency)).unwrap();
        registry.register(Box::new(jitter)).unwrap();
        registry.register(Box::new(unknown)).unwrap();
        registry
    }

    /// Parse sample lines of a text exposition into `series -> value`
    fn parse_text(text: &str) -> HashMap<String, f64> {
        text.lines()
            .filter(|line| !line.starts_with('#') && !line.is_empty())
            .map(|line| {
                let (series, value) = line.rsplit_once(' ').unwrap();
                (series.to_string(), value.parse::<f64>().unwrap())
            })
            .collect()
    }

    fn series_key(family: &FamilyDocument, metric: &MetricDocument) -> String {
        if metric.label.is_empty() {
            return family.name.clone();
        }
        let labels: Vec<String> = metric
            .label
            .iter()
            .map(|l| format!("{}=\"{}\"", l.name, l.value))
            .collect();
        format!("{}{{{}}}", family.name, labels.join(","))
    }

    #[test]
    fn test_text_and_json_agree() {
        let snapshot = MetricSnapshot::gather(true, &sample_registry());
        let from_text = parse_text(&snapshot.text().unwrap());

        let documents: Vec<FamilyDocument> = serde_json::from_str(&snapshot.json().unwrap()).unwrap();
        let mut from_json = HashMap::new();
        for family in &documents {
            for metric in &family.metric {
                let value = metric.gauge.or(metric.counter).or(metric.untyped).unwrap().value;
                from_json.insert(series_key(family, metric), value);
            }
        }

        assert_eq!(from_text.len(), 5);
        assert_eq!(from_text, from_json);
        for value in from_json.values() {
            assert!(from_text.values().any(|v| v.to_bits() == value.to_bits()));
        }
    }

    #[test]
    fn test_documents() {
        let snapshot = MetricSnapshot::gather(true, &sample_registry());
        let documents = snapshot.documents();
        let names: Vec<&str> = documents.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["blackbox_module_unknown_total", "probe_qos_jitter", "probe_qos_latency_gauge"]
        );
        assert_eq!(documents[0].kind, "counter");
        assert_eq!(documents[1].kind, "gauge");
        assert_eq!(documents[1].help, "jitter");
        assert_eq!(documents[2].metric.len(), 3);

        let json = snapshot.json().unwrap();
        assert!(json.contains("\"type\":\"gauge\""));
        assert!(!json.contains("\"histogram\""));
    }

    #[test]
    fn test_value_lookup() {
        let snapshot = MetricSnapshot::gather(false, &sample_registry());
        assert!(!snapshot.success());
        assert_eq!(snapshot.value("probe_qos_latency_gauge", &[("aggregate", "avg")]), Some(261.5));
        assert_eq!(snapshot.value("probe_qos_jitter", &[]), Some(335_000.0));
        assert_eq!(snapshot.value("blackbox_module_unknown_total", &[]), Some(1.0));
        assert_eq!(snapshot.value("probe_qos_latency_gauge", &[]), None);
        assert_eq!(snapshot.value("missing", &[]), None);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MetricSnapshot::new(false, Vec::new());
        assert_eq!(snapshot.text().unwrap(), "");
        assert_eq!(snapshot.json().unwrap(), "[]");
    }
}
