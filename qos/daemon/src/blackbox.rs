//! Probe orchestration
//!
//! [`Blackbox::call`] resolves the effective module, runs the matching
//! prober under a deadline against a private registry, and records the run's
//! trace in the [`ResultHistory`].

use crate::config::Module;
use crate::error::ProbeError;
use crate::history::ResultHistory;
use crate::logger::ScrapeLogger;
use crate::prober::ProberRegistry;
use crate::resolver::{ConfigResolver, ProbeRequest};
use crate::snapshot::MetricSnapshot;
use log::debug;
use probe_common::constants::{
    PROBE_DURATION_SECONDS, PROBE_DURATION_SECONDS_HELP, PROBE_SUCCESS, PROBE_SUCCESS_HELP,
};
use prometheus::{Gauge, IntCounter, Registry};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Extra time granted to a prober past its deadline before it is abandoned
pub const DEADLINE_GRACE: Duration = Duration::from_millis(500);

/// Horizon used when a timeout runs past the clock's range
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Counters about the exporter itself
#[derive(Clone)]
pub struct ExporterMetrics {
    module_unknown: IntCounter,
    prober_unknown: IntCounter,
}

impl ExporterMetrics {
    /// Create the counters and register them into `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let module_unknown = IntCounter::new(
            "blackbox_module_unknown_total",
            "Count of unknown modules requested by probes",
        )?;
        let prober_unknown = IntCounter::new(
            "blackbox_prober_unknown_total",
            "Count of modules referencing an unknown prober",
        )?;
        registry.register(Box::new(module_unknown.clone()))?;
        registry.register(Box::new(prober_unknown.clone()))?;
        Ok(Self {
            module_unknown,
            prober_unknown,
        })
    }

    pub fn module_unknown_total(&self) -> u64 {
        self.module_unknown.get()
    }

    pub fn prober_unknown_total(&self) -> u64 {
        self.prober_unknown.get()
    }
}

/// Probe orchestrator
pub struct Blackbox {
    resolver: ConfigResolver,
    probers: ProberRegistry,
    history: Arc<ResultHistory>,
    metrics: ExporterMetrics,
    timeout_offset: f64,
}

impl Blackbox {
    pub fn new(
        resolver: ConfigResolver,
        probers: ProberRegistry,
        history: Arc<ResultHistory>,
        metrics: ExporterMetrics,
    ) -> Self {
        Self {
            resolver,
            probers,
            history,
            metrics,
            timeout_offset: 0.0,
        }
    }

    /// Default timeout in seconds for requests that carry none
    ///
    /// Non-positive values fall back to the module timeout.
    pub fn with_timeout_offset(mut self, seconds: f64) -> Self {
        self.timeout_offset = seconds;
        self
    }

    pub fn history(&self) -> &Arc<ResultHistory> {
        &self.history
    }

    pub fn metrics(&self) -> &ExporterMetrics {
        &self.metrics
    }

    /// Run `module_name` against `target`
    ///
    /// Failures of the run itself are reported through the snapshot's
    /// success flag and recorded in the history.
    ///
    /// # Errors
    ///
    /// * [`ProbeError::UnknownModule`] if the module is not configured
    /// * [`ProbeError::InvalidModule`] if the overrides are out of bounds
    /// * [`ProbeError::UnknownProber`] if the module's kind has no prober
    /// * [`ProbeError::Gather`] if the run's registry rejects a family
    pub async fn call(
        &self,
        target: &str,
        module_name: &str,
        request: &ProbeRequest,
    ) -> Result<MetricSnapshot, ProbeError> {
        let module = match self.resolver.resolve(module_name, request) {
            Ok(module) => module,
            Err(err) => {
                if let ProbeError::UnknownModule(_) = err {
                    debug!("Unknown module {:?}", module_name);
                    self.metrics.module_unknown.inc();
                } else {
                    debug!("Rejected request for module {:?}: {}", module_name, err);
                }
                return Err(err);
            }
        };

        let Some(prober) = self.probers.get(module.prober) else {
            debug!("Unknown prober {:?} for module {:?}", module.prober.as_str(), module_name);
            self.metrics.prober_unknown.inc();
            return Err(ProbeError::UnknownProber(module.prober.to_string()));
        };

        let override_seconds = if request.timeout_seconds > 0.0 {
            request.timeout_seconds
        } else {
            self.timeout_offset
        };
        let timeout = get_timeout(&module, override_seconds);

        let registry = Registry::new();
        let probe_success = Gauge::new(PROBE_SUCCESS, PROBE_SUCCESS_HELP)?;
        let probe_duration = Gauge::new(PROBE_DURATION_SECONDS, PROBE_DURATION_SECONDS_HELP)?;
        registry.register(Box::new(probe_success.clone()))?;
        registry.register(Box::new(probe_duration.clone()))?;

        let logger = ScrapeLogger::new(module_name, target);
        logger.info(
            "Beginning probe",
            &[("probe", &module.prober), ("timeout_seconds", &timeout.as_secs_f64())],
        );

        let start = Instant::now();
        let deadline = deadline_after(start, timeout);
        let hard_deadline = deadline_after(deadline, DEADLINE_GRACE);

        let success = match timeout_at(
            hard_deadline,
            prober.probe(deadline, target, &module, &registry, &logger),
        )
        .await
        {
            Ok(success) => success,
            Err(_) => {
                logger.error("Probe abandoned after missing its deadline", &[]);
                false
            }
        };

        let elapsed = start.elapsed().as_secs_f64();
        probe_duration.set(elapsed);
        if success {
            probe_success.set(1.0);
            logger.info("Probe succeeded", &[("duration_seconds", &elapsed)]);
        } else {
            logger.error("Probe failed", &[("duration_seconds", &elapsed)]);
        }

        let snapshot = MetricSnapshot::gather(success, &registry);
        let trace = debug_output(&module, &logger.contents(), &snapshot);
        self.history.add(module_name, target, trace, success);

        Ok(snapshot)
    }
}

/// Effective run timeout
///
/// A positive `override_seconds` is used as is; otherwise the module's
/// configured timeout applies.
pub fn get_timeout(module: &Module, override_seconds: f64) -> Duration {
    if override_seconds > 0.0 {
        if let Ok(timeout) = Duration::try_from_secs_f64(override_seconds) {
            return timeout;
        }
    }
    module.timeout
}

/// `start + timeout`, capped at a far-future instant
fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(start)
}

/// Render the history trace of a run
pub fn debug_output(module: &Module, logs: &str, snapshot: &MetricSnapshot) -> String {
    let mut out = String::new();
    out.push_str("Logs for the probe:\n");
    out.push_str(logs);
    out.push_str("\n\n\nMetrics that would have been returned:\n");
    match snapshot.text() {
        Ok(text) => out.push_str(&text),
        Err(err) => {
            let _ = writeln!(out, "Error gathering metrics: {}", err);
        }
    }
    out.push_str("\n\n\nModule configuration:\n");
    match serde_yaml::to_string(module) {
        Ok(yaml) => out.push_str(&yaml),
        Err(err) => {
            let _ = writeln!(out, "Error marshalling config: {}", err);
        }
    }
    out
}
