//! Effective module resolution
//!
//! Looks a module up in the [`SafeConfig`] store and applies the
//! request-scoped overrides of one call. The result is always a detached copy.

use crate::config::{BasicAuth, IcmpQosProbe, Module, SafeConfig};
use crate::error::ProbeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Request-scoped overrides for one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeRequest {
    /// Overrides for HTTP modules
    pub website: Option<WebsiteOverride>,
    /// Overrides for ICMP QoS modules
    pub icmp_qos: Option<IcmpQosOverride>,
    /// Run timeout in seconds; non-positive means "not set"
    pub timeout_seconds: f64,
}

/// Credentials supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub username: String,
    pub password: String,
}

/// HTTP overrides
///
/// `headers`, `method` and `body` always overwrite the configured values,
/// including with empty values. A configured header set is therefore blanked
/// by a request that carries an empty one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsiteOverride {
    pub authorization: Option<Authorization>,
    pub headers: BTreeMap<String, String>,
    pub method: String,
    pub body: String,
}

/// ICMP QoS overrides; unset fields keep the configured value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpQosOverride {
    pub packet_size: Option<usize>,
    pub count: Option<usize>,
    pub interval: Option<Duration>,
}

/// Resolves module names into effective configurations
#[derive(Clone)]
pub struct ConfigResolver {
    store: Arc<SafeConfig>,
}

impl ConfigResolver {
    pub fn new(store: Arc<SafeConfig>) -> Self {
        Self { store }
    }

    /// Backing configuration store
    pub fn store(&self) -> &Arc<SafeConfig> {
        &self.store
    }

    /// Produce the effective module for one call
    ///
    /// # Errors
    ///
    /// * [`ProbeError::UnknownModule`] if `module_name` is not configured
    /// * [`ProbeError::InvalidModule`] if the overrides leave the module
    ///   outside its parameter bounds
    pub fn resolve(&self, module_name: &str, request: &ProbeRequest) -> Result<Module, ProbeError> {
        let mut module = self
            .store
            .module(module_name)
            .ok_or_else(|| ProbeError::UnknownModule(module_name.to_string()))?;

        if let Some(website) = &request.website {
            apply_website(&mut module, website);
        }
        if let Some(qos) = &request.icmp_qos {
            apply_icmp_qos(&mut module, qos);
            module.validate(module_name)?;
        }

        Ok(module)
    }
}

fn apply_website(module: &mut Module, website: &WebsiteOverride) {
    if let Some(auth) = &website.authorization {
        if !auth.username.is_empty() && !auth.password.is_empty() {
            module.http.basic_auth = Some(BasicAuth {
                username: auth.username.clone(),
                password: auth.password.clone(),
            });
        }
    }

    module.http.headers = website.headers.clone();
    module.http.method = website.method.clone();
    module.http.body = website.body.clone();
}

fn apply_icmp_qos(module: &mut Module, qos: &IcmpQosOverride) {
    let defaults = IcmpQosProbe::default();
    let params = &mut module.icmp_qos;

    if let Some(packet_size) = qos.packet_size {
        params.packet_size = packet_size;
    }
    if let Some(count) = qos.count {
        params.count = count;
    }
    if let Some(interval) = qos.interval {
        params.interval = interval;
    }
    // Timeout and TTL are never caller-controlled.
    params.timeout = defaults.timeout;
    params.ttl = defaults.ttl;
}
