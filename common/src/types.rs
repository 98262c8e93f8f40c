//! Shared data structures between probe implementations and consumers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Probe kind of a module
///
/// The kind selects both the probe implementation and the parameter block
/// that applies to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// HTTP request probe
    Http,
    /// TCP connect probe
    Tcp,
    /// Single ICMP echo probe
    Icmp,
    /// ICMP echo series with loss, latency and jitter aggregates
    IcmpQos,
    /// DNS query probe
    Dns,
    /// gRPC health probe
    Grpc,
}

impl ProbeKind {
    /// All known kinds
    pub const ALL: [ProbeKind; 6] = [
        ProbeKind::Http,
        ProbeKind::Tcp,
        ProbeKind::Icmp,
        ProbeKind::IcmpQos,
        ProbeKind::Dns,
        ProbeKind::Grpc,
    ];

    /// Name used in configuration files and the prober registry
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Http => "http",
            ProbeKind::Tcp => "tcp",
            ProbeKind::Icmp => "icmp",
            ProbeKind::IcmpQos => "icmp_qos",
            ProbeKind::Dns => "dns",
            ProbeKind::Grpc => "grpc",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProbeKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown probe kind {:?}", s))
    }
}

/// Packet-level event observed during one QoS run
///
/// Events are ephemeral: they are produced by the transport and consumed by
/// the statistics engine of the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketEvent {
    /// Echo request handed to the transport
    Sent {
        /// Sequence number
        seq: u16,
    },
    /// Echo reply matched to a request
    Received {
        /// Sequence number
        seq: u16,
        /// Measured round-trip time
        rtt: Duration,
    },
    /// Request timed out or the receive failed
    Lost {
        /// Sequence number
        seq: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_kind_names() {
        for kind in ProbeKind::ALL {
            assert_eq!(kind.as_str().parse::<ProbeKind>(), Ok(kind));
        }
        assert!("snmp".parse::<ProbeKind>().is_err());
    }
}
