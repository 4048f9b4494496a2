//! Engine tunables and configuration loading.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Knobs governing protocol selection and resource limits.
///
/// Every field has a default, so a TOML table may set any subset:
///
/// ```
/// let tun = remma::Tunables::from_toml_str("tagged_rma = false").unwrap();
/// assert!(!tun.tagged_rma);
/// assert_eq!(tun.inject_max, remma::Tunables::default().inject_max);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Largest payload carried inline in one AM request packet; writes
    /// fragment at this size.
    pub max_request_short: usize,
    /// Largest payload carried in one AM reply packet; reads fragment at
    /// this size.
    pub max_reply_short: usize,
    /// Upper bound on inject-mode writes.
    pub inject_max: usize,
    /// Use the tagged-MQ long protocol for transfers larger than one
    /// packet.
    pub tagged_rma: bool,
    /// Cap on live request records per domain.
    pub max_requests: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_request_short: 1024,
            max_reply_short: 1024,
            inject_max: 64,
            tagged_rma: true,
            max_requests: 4096,
        }
    }
}

impl Tunables {
    /// Parse tunables from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load tunables from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let tunables = Self::from_toml_str(&text)?;
        log::debug!("remma: loaded tunables: {:?}", tunables);
        Ok(tunables)
    }
}

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for [`Tunables`].
    #[error("cannot parse config file")]
    Parse(#[from] toml::de::Error),
}
