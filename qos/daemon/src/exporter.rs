//! Snapshot exporters
//!
//! Writes a [`MetricSnapshot`] to a file in text exposition or JSON form.

use crate::snapshot::MetricSnapshot;
use anyhow::{Context, Result};
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Trait for snapshot exporters
pub trait MetricsExporter {
    /// Render a snapshot
    ///
    /// # Arguments
    ///
    /// * `snapshot` - Gathered measurements of one run
    fn render(&self, snapshot: &MetricSnapshot) -> Result<String>;

    /// File the snapshot is written to
    fn output_path(&self) -> &Path;

    /// Render and write a snapshot
    fn export(&self, snapshot: &MetricSnapshot) -> Result<()> {
        let data = self.render(snapshot)?;
        let path = self.output_path();

        let mut file =
            File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;

        file.write_all(data.as_bytes())
            .with_context(|| format!("Failed to write to output file: {:?}", path))?;

        Ok(())
    }
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// Prometheus text exposition
    Text,
    /// JSON family documents
    Json,
}

impl FromStr for ExporterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "prometheus" | "prom" => Ok(ExporterType::Text),
            "json" => Ok(ExporterType::Json),
            _ => anyhow::bail!("Unsupported format: {}. Use text or json", s),
        }
    }
}

/// Text exposition exporter
pub struct TextExporter {
    output_path: PathBuf,
}

impl TextExporter {
    /// Create a new text exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }
}

impl MetricsExporter for TextExporter {
    fn render(&self, snapshot: &MetricSnapshot) -> Result<String> {
        snapshot.text().context("Failed to encode metrics")
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn render(&self, snapshot: &MetricSnapshot) -> Result<String> {
        let json = if self.pretty {
            snapshot.json_pretty()?
        } else {
            snapshot.json()?
        };
        Ok(json)
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }
}

/// Exporter for `format` writing to `output_path`
pub fn exporter_for(format: ExporterType, output_path: PathBuf) -> Box<dyn MetricsExporter> {
    match format {
        ExporterType::Text => Box::new(TextExporter::new(output_path)),
        ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Gauge, Registry};

    fn create_test_snapshot() -> MetricSnapshot {
        let registry = Registry::new();
        let success = Gauge::new("probe_success", "Displays whether or not the probe was a success").unwrap();
        success.set(1.0);
        registry.register(Box::new(success)).unwrap();
        MetricSnapshot::gather(true, &registry)
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("json".parse::<ExporterType>().unwrap(), ExporterType::Json);
        assert_eq!("TEXT".parse::<ExporterType>().unwrap(), ExporterType::Text);
        assert_eq!("prom".parse::<ExporterType>().unwrap(), ExporterType::Text);
        assert!("influx".parse::<ExporterType>().is_err());
    }

    #[test]
    fn test_text_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        TextExporter::new(path.clone()).export(&create_test_snapshot()).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("# TYPE probe_success gauge"));
        assert!(written.contains("probe_success 1"));
    }

    #[test]
    fn test_json_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        exporter_for(ExporterType::Json, path.clone())
            .export(&create_test_snapshot())
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written[0]["name"], "probe_success");
        assert_eq!(written[0]["type"], "gauge");
        assert_eq!(written[0]["metric"][0]["gauge"]["value"], 1.0);
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("metrics.json");
        let err = JsonExporter::new(path, false)
            .export(&create_test_snapshot())
            .unwrap_err();
        assert!(err.to_string().contains("Failed to create output file"));
    }
}
