//! Probe implementations
//!
//! A [`Prober`] runs one probe against a target under a deadline, registers
//! its measurement families into the run's private registry and reports a
//! boolean outcome. Failures during the run are logged to the run's
//! [`ScrapeLogger`] and never returned as errors.

mod icmp;
mod icmp_qos;
mod tcp;

pub use icmp::IcmpProber;
pub use icmp_qos::{IcmpQosProber, QosGauges};
pub use tcp::TcpProber;

use crate::config::{IpProtocol, Module};
use crate::icmp::IcmpTransport;
use crate::logger::ScrapeLogger;
use async_trait::async_trait;
use probe_common::ProbeKind;
use prometheus::Registry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;

/// Probe function contract
#[async_trait]
pub trait Prober: Send + Sync {
    /// Run one probe
    ///
    /// # Arguments
    ///
    /// * `deadline` - Instant by which the run must have finished
    /// * `target` - Host, address or `host:port`, depending on the prober
    /// * `module` - Effective module configuration
    /// * `registry` - Private registry of this run
    /// * `logger` - Logger capturing the run's trace
    ///
    /// # Returns
    ///
    /// `true` if the probe succeeded
    async fn probe(
        &self,
        deadline: Instant,
        target: &str,
        module: &Module,
        registry: &Registry,
        logger: &ScrapeLogger,
    ) -> bool;
}

/// Probe implementations by kind
#[derive(Clone, Default)]
pub struct ProberRegistry {
    probers: HashMap<ProbeKind, Arc<dyn Prober>>,
}

impl ProberRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the socket-backed `icmp_qos`, `icmp` and `tcp` probers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ProbeKind::IcmpQos, Arc::new(IcmpQosProber::new(IcmpTransport::new())));
        registry.register(ProbeKind::Icmp, Arc::new(IcmpProber::new(IcmpTransport::new())));
        registry.register(ProbeKind::Tcp, Arc::new(TcpProber::new()));
        registry
    }

    /// Register `prober` for `kind`, replacing any previous implementation
    pub fn register(&mut self, kind: ProbeKind, prober: Arc<dyn Prober>) {
        self.probers.insert(kind, prober);
    }

    pub fn get(&self, kind: ProbeKind) -> Option<Arc<dyn Prober>> {
        self.probers.get(&kind).cloned()
    }

    /// Kinds with a registered implementation
    pub fn kinds(&self) -> Vec<ProbeKind> {
        ProbeKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.probers.contains_key(kind))
            .collect()
    }
}

/// Value of `probe_ip_protocol` for an address
fn ip_protocol_value(ip: IpAddr) -> f64 {
    match ip {
        IpAddr::V4(_) => 4.0,
        IpAddr::V6(_) => 6.0,
    }
}

fn protocol_matches(ip: IpAddr, protocol: IpProtocol) -> bool {
    match protocol {
        IpProtocol::Ip4 => ip.is_ipv4(),
        IpProtocol::Ip6 => ip.is_ipv6(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_kinds() {
        let registry = ProberRegistry::with_defaults();
        assert_eq!(
            registry.kinds(),
            vec![ProbeKind::Tcp, ProbeKind::Icmp, ProbeKind::IcmpQos]
        );
        assert!(registry.get(ProbeKind::Http).is_none());
        assert!(registry.get(ProbeKind::Dns).is_none());
        assert!(registry.get(ProbeKind::Grpc).is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ProberRegistry::new();
        assert!(registry.kinds().is_empty());

        registry.register(ProbeKind::Http, Arc::new(TcpProber::new()));
        assert_eq!(registry.kinds(), vec![ProbeKind::Http]);
    }

    #[test]
    fn test_protocol_helpers() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(ip_protocol_value(v4), 4.0);
        assert_eq!(ip_protocol_value(v6), 6.0);
        assert!(protocol_matches(v4, IpProtocol::Ip4));
        assert!(!protocol_matches(v4, IpProtocol::Ip6));
    }
}
