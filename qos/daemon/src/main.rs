//! Blackbox QoS probe - command line runner
//!
//! Loads a module file, runs one probe against a target and prints or writes
//! the resulting metric snapshot.
//!
//! ## Usage
//!
//! ```bash
//! # Run the icmp_qos module against a host (raw sockets need CAP_NET_RAW)
//! sudo ./blackbox-qos --config blackbox.yml --module icmp_qos --target 192.0.2.10
//!
//! # Override the echo series and write JSON
//! ./blackbox-qos -m icmp_qos -t example.com --count 20 --interval 200ms \
//!     --format json --output metrics.json
//!
//! # Show the recorded trace of the run
//! ./blackbox-qos -m tcp_connect -t example.com:443 --show-trace
//! ```

use anyhow::{Context, Result};
use blackbox_qos::{
    exporter::{exporter_for, ExporterType},
    resolver::{Authorization, IcmpQosOverride, WebsiteOverride},
    Blackbox, ConfigResolver, ExporterMetrics, MetricSnapshot, ProbeRequest, ProberRegistry,
    ResultHistory, SafeConfig,
};
use clap::Parser;
use log::info;
use probe_common::constants::{
    DEFAULT_HISTORY_LIMIT, LABEL_AGGREGATE, LABEL_TOTAL, PROBE_DURATION_SECONDS, QOS_JITTER,
    QOS_LATENCY, QOS_PACKET_LOSS,
};
use prometheus::Registry;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

/// Time-bounded network quality probe
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Module configuration file
    #[clap(short, long, default_value = "blackbox.yml")]
    config: PathBuf,

    /// Module to run
    #[clap(short, long)]
    module: String,

    /// Probe target (host, address or host:port)
    #[clap(short, long)]
    target: String,

    /// Output format (text, json)
    #[clap(short, long, default_value = "text")]
    format: String,

    /// Output file for the snapshot (stdout if omitted)
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Number of run traces to retain
    #[clap(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    history_limit: usize,

    /// Run timeout in seconds (0 = module timeout)
    #[clap(long, default_value_t = 0.0)]
    timeout: f64,

    /// ICMP QoS payload size in bytes
    #[clap(long)]
    packet_size: Option<usize>,

    /// ICMP QoS number of echo requests
    #[clap(long)]
    count: Option<usize>,

    /// ICMP QoS delay between requests (e.g. 250ms)
    #[clap(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// HTTP header as "Name: value", repeatable
    #[clap(long)]
    header: Vec<String>,

    /// HTTP method
    #[clap(long)]
    method: Option<String>,

    /// HTTP request body
    #[clap(long)]
    body: Option<String>,

    /// HTTP basic auth username
    #[clap(long)]
    username: Option<String>,

    /// HTTP basic auth password
    #[clap(long)]
    password: Option<String>,

    /// Print the recorded trace of the run
    #[clap(long)]
    show_trace: bool,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    info!("Starting blackbox QoS probe...");
    info!("   Config: {:?}", args.config);
    info!("   Module: {}", args.module);
    info!("   Target: {}", args.target);
    info!("   Format: {}", args.format);

    let format: ExporterType = args.format.parse()?;
    let request = build_request(&args)?;

    let store = Arc::new(SafeConfig::default());
    store
        .reload_config(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;
    info!("Loaded {} modules", store.current().modules.len());

    let registry = Registry::new();
    let blackbox = Blackbox::new(
        ConfigResolver::new(store),
        ProberRegistry::with_defaults(),
        Arc::new(ResultHistory::new(args.history_limit)),
        ExporterMetrics::new(&registry)?,
    );

    let snapshot = blackbox
        .call(&args.target, &args.module, &request)
        .await
        .with_context(|| format!("Probe {:?} against {:?} failed", args.module, args.target))?;

    match &args.output {
        Some(path) => {
            exporter_for(format, path.clone()).export(&snapshot)?;
            info!("Metrics written to {:?}", path);
        }
        None => {
            let exporter = exporter_for(format, PathBuf::new());
            println!("{}", exporter.render(&snapshot)?);
        }
    }

    if args.show_trace {
        if let Some(entry) = blackbox.history().recent(1).pop() {
            println!("{}", entry.debug_output);
        }
    }

    print_summary(&snapshot);

    if !snapshot.success() {
        anyhow::bail!("Probe failed");
    }
    Ok(())
}

/// Assemble the request-scoped overrides from the command line
fn build_request(args: &Args) -> Result<ProbeRequest> {
    let mut request = ProbeRequest {
        timeout_seconds: args.timeout,
        ..Default::default()
    };

    if args.packet_size.is_some() || args.count.is_some() || args.interval.is_some() {
        request.icmp_qos = Some(IcmpQosOverride {
            packet_size: args.packet_size,
            count: args.count,
            interval: args.interval,
        });
    }

    let http_override = !args.header.is_empty()
        || args.method.is_some()
        || args.body.is_some()
        || args.username.is_some()
        || args.password.is_some();
    if http_override {
        let mut headers = BTreeMap::new();
        for header in &args.header {
            let (name, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header {:?}, expected \"Name: value\"", header))?;
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }

        let authorization = match (&args.username, &args.password) {
            (None, None) => None,
            (username, password) => Some(Authorization {
                username: username.clone().unwrap_or_default(),
                password: password.clone().unwrap_or_default(),
            }),
        };

        request.website = Some(WebsiteOverride {
            authorization,
            headers,
            method: args.method.clone().unwrap_or_default(),
            body: args.body.clone().unwrap_or_default(),
        });
    }

    Ok(request)
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║            Blackbox QoS Probe                     ║
║     Packet Loss / Latency / Jitter                ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(snapshot: &MetricSnapshot) {
    let value = |name: &str, labels: &[(&str, &str)]| snapshot.value(name, labels).unwrap_or(0.0);

    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Success:            {}", snapshot.success());
    info!("  Duration:           {:.3} seconds", value(PROBE_DURATION_SECONDS, &[]));

    if snapshot.value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "sent")]).is_some() {
        info!("");
        info!("  Packets:");
        for total in ["sent", "received", "loss"] {
            info!("    {:<16}{:>10}", total, value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, total)]));
        }
        info!(
            "    {:<16}{:>10.2}%",
            "loss",
            value(QOS_PACKET_LOSS, &[(LABEL_TOTAL, "loss_percentage")])
        );
        info!("");
        info!("  Latency (ms):");
        for aggregate in ["min", "avg", "max", "standard_deviation"] {
            info!(
                "    {:<20}{:>10.3}",
                aggregate,
                value(QOS_LATENCY, &[(LABEL_AGGREGATE, aggregate)])
            );
        }
        info!("");
        info!("  Jitter (μs):");
        info!("    {:<20}{:>10.1}", "mean", value(QOS_JITTER, &[]));
    }

    info!("");
    info!("============================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request() {
        let args = Args::parse_from([
            "blackbox-qos",
            "-m",
            "icmp_qos",
            "-t",
            "192.0.2.1",
            "--count",
            "3",
            "--interval",
            "250ms",
            "--header",
            "Accept: text/plain",
            "--username",
            "svc",
        ]);
        let request = build_request(&args).unwrap();

        let qos = request.icmp_qos.unwrap();
        assert_eq!(qos.count, Some(3));
        assert_eq!(qos.interval, Some(Duration::from_millis(250)));
        assert_eq!(qos.packet_size, None);

        let website = request.website.unwrap();
        assert_eq!(website.headers["Accept"], "text/plain");
        assert_eq!(website.authorization.unwrap().password, "");
        assert_eq!(request.timeout_seconds, 0.0);
    }

    #[test]
    fn test_no_overrides() {
        let args = Args::parse_from(["blackbox-qos", "-m", "tcp_connect", "-t", "example.com:443"]);
        let request = build_request(&args).unwrap();
        assert_eq!(request, ProbeRequest::default());
    }

    #[test]
    fn test_invalid_header() {
        let args = Args::parse_from(["blackbox-qos", "-m", "h", "-t", "x", "--header", "no-colon"]);
        assert!(build_request(&args).is_err());
    }
}
