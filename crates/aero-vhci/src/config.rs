use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::FetchTimeout;
use crate::port::MAX_PORTS;

pub const DEFAULT_PORT_COUNT: u8 = 1;

/// Start-time configuration of a virtual host controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VhciConfig {
    /// Number of root-hub ports, 1..=31.
    pub port_count: u8,
    /// Work-fetch wait in milliseconds: 0 polls, positive waits (capped at one second), negative
    /// waits without limit.
    pub fetch_timeout_ms: i16,
}

impl Default for VhciConfig {
    fn default() -> Self {
        Self {
            port_count: DEFAULT_PORT_COUNT,
            fetch_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("port count must be between 1 and {max}, got {got}")]
    PortCount { got: u8, max: u8 },

    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

impl VhciConfig {
    pub fn new(port_count: u8) -> Self {
        Self {
            port_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PORTS).contains(&self.port_count) {
            return Err(ConfigError::PortCount {
                got: self.port_count,
                max: MAX_PORTS,
            });
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> FetchTimeout {
        FetchTimeout::from_millis(self.fetch_timeout_ms)
    }

    /// Reads `AERO_VHCI_PORTS` and `AERO_VHCI_FETCH_TIMEOUT_MS`, falling back to the defaults for
    /// unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(raw) = lookup("AERO_VHCI_PORTS") {
            cfg.port_count = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("AERO_VHCI_PORTS"))?;
        }
        if let Some(raw) = lookup("AERO_VHCI_FETCH_TIMEOUT_MS") {
            cfg.fetch_timeout_ms = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("AERO_VHCI_FETCH_TIMEOUT_MS"))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
