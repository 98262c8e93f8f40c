//! Error taxonomy for probe calls
//!
//! Only configuration resolution and registry failures surface as errors.
//! Transport setup failures and deadline expiry are reported as failed runs.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the orchestrator and the configuration store
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Requested module is not present in the configuration store
    #[error("unknown module {0:?}")]
    UnknownModule(String),

    /// Module references a probe kind without a registered implementation
    #[error("unknown prober {0:?}")]
    UnknownProber(String),

    /// Measurement registry rejected a family or could not be collected
    #[error("failed to gather metrics: {0}")]
    Gather(#[from] prometheus::Error),

    /// Configuration file could not be read
    #[error("error reading config file {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid YAML for the module schema
    #[error("error parsing config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Module failed validation
    #[error("invalid module {module:?}: {reason}")]
    InvalidModule { module: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ProbeError::UnknownModule("nope".to_string()).to_string(),
            "unknown module \"nope\""
        );
        assert_eq!(
            ProbeError::UnknownProber("dns".to_string()).to_string(),
            "unknown prober \"dns\""
        );
    }
}
