//! Probe module configuration
//!
//! Modules are loaded from a YAML file into an immutable [`Config`]
//! generation. [`SafeConfig`] holds the active generation and swaps whole
//! generations on reload, so readers never observe a partial update.

use crate::error::ProbeError;
use log::info;
use parking_lot::RwLock;
use probe_common::{constants, ProbeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Humantime (de)serialization for durations such as `"5s"` or `"250ms"`
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// All modules of one configuration generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modules: HashMap<String, Module>,
}

impl Config {
    /// Parse and validate a configuration document
    pub fn from_yaml(yaml: &str) -> Result<Self, ProbeError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProbeError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ProbeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Check every module
    pub fn validate(&self) -> Result<(), ProbeError> {
        for (name, module) in &self.modules {
            module.validate(name)?;
        }
        Ok(())
    }
}

/// Named probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Probe kind
    pub prober: ProbeKind,
    /// Run timeout, used when the caller does not override it
    #[serde(with = "duration_str", default = "default_module_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub http: HttpProbe,
    #[serde(default)]
    pub tcp: TcpProbe,
    #[serde(default)]
    pub icmp: IcmpProbe,
    #[serde(default)]
    pub icmp_qos: IcmpQosProbe,
    #[serde(default)]
    pub dns: DnsProbe,
    #[serde(default)]
    pub grpc: GrpcProbe,
}

/// Sequence numbers are 16 bit
pub const MAX_PACKET_COUNT: usize = u16::MAX as usize + 1;

/// Largest echo payload that fits an IPv4 datagram
pub const MAX_PACKET_SIZE: usize = 65_507;

/// Upper bound for the delay between two echo requests
pub const MAX_PACKET_INTERVAL: Duration = Duration::from_secs(3600);

/// Upper bound for the per-packet reply window
pub const MAX_PACKET_TIMEOUT: Duration = Duration::from_secs(3600);

fn default_module_timeout() -> Duration {
    Duration::from_secs(constants::DEFAULT_MODULE_TIMEOUT_SECS)
}

impl Module {
    /// Module of the given kind with default parameter blocks
    pub fn new(prober: ProbeKind) -> Self {
        Self {
            prober,
            timeout: default_module_timeout(),
            http: HttpProbe::default(),
            tcp: TcpProbe::default(),
            icmp: IcmpProbe::default(),
            icmp_qos: IcmpQosProbe::default(),
            dns: DnsProbe::default(),
            grpc: GrpcProbe::default(),
        }
    }

    /// Check that the parameter block for the module's kind is usable
    pub fn validate(&self, name: &str) -> Result<(), ProbeError> {
        let invalid = |reason: &str| ProbeError::InvalidModule {
            module: name.to_string(),
            reason: reason.to_string(),
        };

        if self.timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }
        match self.prober {
            ProbeKind::IcmpQos => self.icmp_qos.check().map_err(invalid),
            ProbeKind::Icmp if self.icmp.payload_size > MAX_PACKET_SIZE => {
                Err(invalid("icmp.payload_size exceeds the largest echo payload"))
            }
            _ => Ok(()),
        }
    }
}

/// Address family preference when resolving a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpProtocol {
    #[default]
    Ip4,
    Ip6,
}

/// Basic authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// HTTP probe parameters, consumed by an externally registered prober
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProbe {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub basic_auth: Option<BasicAuth>,
    pub valid_status_codes: Vec<u16>,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
            basic_auth: None,
            valid_status_codes: Vec::new(),
        }
    }
}

/// TCP connect probe parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpProbe {
    pub preferred_ip_protocol: IpProtocol,
}

/// Single echo probe parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpProbe {
    pub preferred_ip_protocol: IpProtocol,
    pub payload_size: usize,
    pub ttl: u32,
    pub privileged: bool,
}

impl Default for IcmpProbe {
    fn default() -> Self {
        Self {
            preferred_ip_protocol: IpProtocol::Ip4,
            payload_size: constants::DEFAULT_PACKET_SIZE,
            ttl: constants::DEFAULT_TTL,
            privileged: true,
        }
    }
}

/// Echo series parameters for the QoS probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpQosProbe {
    /// Payload size in bytes
    pub packet_size: usize,
    /// Number of echo requests
    pub count: usize,
    /// Delay between consecutive requests
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Per-packet reply window; lost packets are penalized with this value
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub ttl: u32,
    pub privileged: bool,
    pub preferred_ip_protocol: IpProtocol,
}

impl IcmpQosProbe {
    /// Check that a series with these parameters can be scheduled
    pub fn check(&self) -> Result<(), &'static str> {
        if self.count == 0 {
            return Err("icmp_qos.count must be at least 1");
        }
        if self.count > MAX_PACKET_COUNT {
            return Err("icmp_qos.count exceeds the sequence number space");
        }
        if self.packet_size > MAX_PACKET_SIZE {
            return Err("icmp_qos.packet_size exceeds the largest echo payload");
        }
        if self.interval > MAX_PACKET_INTERVAL {
            return Err("icmp_qos.interval exceeds one hour");
        }
        if self.timeout.is_zero() {
            return Err("icmp_qos.timeout must be positive");
        }
        if self.timeout > MAX_PACKET_TIMEOUT {
            return Err("icmp_qos.timeout exceeds one hour");
        }
        Ok(())
    }
}

impl Default for IcmpQosProbe {
    fn default() -> Self {
        Self {
            packet_size: constants::DEFAULT_PACKET_SIZE,
            count: constants::DEFAULT_PACKET_COUNT,
            interval: Duration::from_millis(constants::DEFAULT_INTERVAL_MS),
            timeout: Duration::from_millis(constants::DEFAULT_PACKET_TIMEOUT_MS),
            ttl: constants::DEFAULT_TTL,
            privileged: true,
            preferred_ip_protocol: IpProtocol::Ip4,
        }
    }
}

/// DNS probe parameters, consumed by an externally registered prober
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsProbe {
    pub query_name: String,
    pub query_type: String,
    pub transport_protocol: String,
}

/// gRPC probe parameters, consumed by an externally registered prober
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcProbe {
    pub service: String,
    pub tls: bool,
}

/// Configuration store shared between resolutions and reloads
pub struct SafeConfig {
    current: RwLock<Arc<Config>>,
}

impl SafeConfig {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Replace the active generation, returning the previous one
    pub fn swap(&self, config: Config) -> Arc<Config> {
        let mut guard = self.current.write();
        std::mem::replace(&mut *guard, Arc::new(config))
    }

    /// Load a new generation from disk
    ///
    /// The file is parsed and validated before the write lock is taken; on
    /// error the active generation is left untouched.
    pub fn reload_config(&self, path: impl AsRef<Path>) -> Result<(), ProbeError> {
        let config = Config::load(path.as_ref())?;
        let modules = config.modules.len();
        self.swap(config);
        info!("Loaded config file {:?} ({} modules)", path.as_ref(), modules);
        Ok(())
    }

    /// Active generation
    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.current.read())
    }

    /// Copy of one module, taken under the read lock
    pub fn module(&self, name: &str) -> Option<Module> {
        self.current.read().modules.get(name).cloned()
    }
}

impl Default for SafeConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
